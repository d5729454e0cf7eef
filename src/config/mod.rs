use serde::{Deserialize, Serialize};
use std::path::Path;
use anyhow::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub artifacts: ArtifactsConfig,
    pub ingestion: IngestionConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub scope: String,
    pub date: String,
    pub cadence_sec: u64,
    pub sandbox: bool,
    pub horizon_min: i64,
    pub bucket_min: i64,
    pub epsilon: f64,
    pub use_ga: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    pub root: String,
    pub station_map: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub enabled: bool,
    /// JSONL file watched by the file-drop adapter, relative to the scope
    /// directory.
    pub live_events_file: String,
    pub poll_url: Option<String>,
    pub poll_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub prometheus_enabled: bool,
    pub metrics_collection_interval_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                cors_enabled: true,
            },
            engine: EngineSettings {
                scope: "all_india".to_string(),
                date: "2024-01-01".to_string(),
                cadence_sec: 120,
                sandbox: true,
                horizon_min: 60,
                bucket_min: 5,
                epsilon: 0.2,
                use_ga: false,
            },
            artifacts: ArtifactsConfig {
                root: "artifacts".to_string(),
                station_map: "artifacts/station_map.csv".to_string(),
            },
            ingestion: IngestionConfig {
                enabled: true,
                live_events_file: "events_live.jsonl".to_string(),
                poll_url: None,
                poll_timeout_seconds: 10,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            monitoring: MonitoringConfig {
                prometheus_enabled: true,
                metrics_collection_interval_seconds: 15,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig::default();

        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            config.server.port = port.parse()?;
        }
        if let Ok(scope) = std::env::var("ENGINE_SCOPE") {
            config.engine.scope = scope;
        }
        if let Ok(date) = std::env::var("ENGINE_DATE") {
            config.engine.date = date;
        }
        if let Ok(cadence) = std::env::var("ENGINE_CADENCE_SEC") {
            config.engine.cadence_sec = cadence.parse()?;
        }
        if let Ok(sandbox) = std::env::var("ENGINE_SANDBOX") {
            config.engine.sandbox = sandbox.parse()?;
        }
        if let Ok(root) = std::env::var("ARTIFACTS_ROOT") {
            config.artifacts.station_map = format!("{root}/station_map.csv");
            config.artifacts.root = root;
        }
        if let Ok(url) = std::env::var("INGEST_POLL_URL") {
            config.ingestion.poll_url = Some(url);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.engine.cadence_sec == 0 {
            return Err(anyhow::anyhow!("Engine cadence must be positive"));
        }
        if self.engine.horizon_min <= 0 {
            return Err(anyhow::anyhow!("Radar horizon must be positive"));
        }
        if self.engine.bucket_min <= 0 {
            return Err(anyhow::anyhow!("Radar bucket size must be positive"));
        }
        if !(0.0..=1.0).contains(&self.engine.epsilon) {
            return Err(anyhow::anyhow!("Epsilon must be within [0, 1]"));
        }
        if self.artifacts.root.is_empty() {
            return Err(anyhow::anyhow!("Artifacts root cannot be empty"));
        }
        Ok(())
    }

    /// Get server bind address
    pub fn server_bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.engine.cadence_sec, 120);
        assert!(config.engine.sandbox);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.engine.horizon_min, deserialized.engine.horizon_min);
    }

    #[test]
    fn test_config_file_operations() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = AppConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config.server.port, loaded_config.server.port);
        assert_eq!(config.engine.scope, loaded_config.engine.scope);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.engine.horizon_min = 0;
        assert!(config.validate().is_err());
    }
}
