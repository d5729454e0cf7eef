//! Path-addressed artifact persistence: `artifacts/<scope>/<date>/`.
//!
//! JSON artifacts are UTF-8 with 2-space indent; tabular artifacts are
//! parquet with RFC 3339 UTC timestamp columns. Every write goes to a
//! temporary file and is renamed into place, with one retry on transient
//! failure.

pub mod rows;

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::datatypes::FieldRef;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_arrow::schema::{SchemaLike, TracingOptions};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

// JSON artifacts
pub const SIM_KPIS: &str = "national_sim_kpis.json";
pub const CONFLICT_RADAR: &str = "conflict_radar.json";
pub const MITIGATION_PREVIEW: &str = "mitigation_preview.json";
pub const RISK_KPIS: &str = "risk_kpis.json";
pub const RISK_VALIDATION: &str = "risk_validation.json";
pub const REC_PLAN: &str = "rec_plan.json";
pub const REC_PLAN_PREV: &str = "rec_plan_prev.json";
pub const ALT_OPTIONS: &str = "alt_options.json";
pub const PLAN_METRICS: &str = "plan_metrics.json";
pub const AUDIT_LOG: &str = "audit_log.json";
pub const PLAN_APPLY_REPORT: &str = "plan_apply_report.json";
pub const AUDIT_TRAIL: &str = "audit_trail.json";
pub const POLICY_STATE: &str = "policy_state.json";
pub const PROVENANCE: &str = "provenance.json";
pub const LOCKS_STATE: &str = "locks_state.json";
pub const INCIDENT_HEAT: &str = "incident_heat.json";

// Tabular artifacts
pub const EVENTS_CLEAN: &str = "events_clean.parquet";
pub const SECTION_NODES: &str = "section_nodes.parquet";
pub const SECTION_EDGES: &str = "section_edges.parquet";
pub const BLOCK_OCCUPANCY: &str = "national_block_occupancy.parquet";
pub const PLATFORM_OCCUPANCY: &str = "national_platform_occupancy.parquet";
pub const WAITING_LEDGER: &str = "national_waiting_ledger.parquet";
pub const RISK_TIMELINE: &str = "risk_timeline.parquet";
pub const FEEDBACK: &str = "feedback.parquet";
pub const IL_TRAINING: &str = "il_training.parquet";

// Learning side-outputs shared across runs
pub const GLOBAL_MODELS_DIR: &str = "global_models";
pub const OFFLINE_RL: &str = "offline_rl.jsonl";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope_dir(&self, scope: &str, date: &str) -> PathBuf {
        self.root.join(scope).join(date)
    }

    pub fn artifact_path(&self, scope: &str, date: &str, name: &str) -> PathBuf {
        self.scope_dir(scope, date).join(name)
    }

    pub fn global_path(&self, name: &str) -> PathBuf {
        self.root.join(GLOBAL_MODELS_DIR).join(name)
    }

    pub fn exists(&self, scope: &str, date: &str, name: &str) -> bool {
        self.artifact_path(scope, date, name).exists()
    }

    pub fn write_json<T: Serialize>(
        &self,
        scope: &str,
        date: &str,
        name: &str,
        value: &T,
    ) -> CoreResult<()> {
        let path = self.artifact_path(scope, date, name);
        let bytes = serde_json::to_vec_pretty(value)?;
        atomic_write(&path, &bytes)
    }

    pub fn read_json<T: DeserializeOwned>(&self, scope: &str, date: &str, name: &str) -> CoreResult<T> {
        let path = self.artifact_path(scope, date, name);
        if !path.exists() {
            return Err(CoreError::MissingArtifact(path));
        }
        let bytes = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn read_json_or<T: DeserializeOwned + Default>(
        &self,
        scope: &str,
        date: &str,
        name: &str,
    ) -> T {
        self.read_json(scope, date, name).unwrap_or_default()
    }

    pub fn write_parquet<T: Serialize + DeserializeOwned>(
        &self,
        scope: &str,
        date: &str,
        name: &str,
        items: &[T],
    ) -> CoreResult<()> {
        let path = self.artifact_path(scope, date, name);
        write_parquet_file(&path, items)
    }

    pub fn read_parquet<T: DeserializeOwned>(
        &self,
        scope: &str,
        date: &str,
        name: &str,
    ) -> CoreResult<Vec<T>> {
        let path = self.artifact_path(scope, date, name);
        read_parquet_file(&path)
    }

    /// Append one JSON line to a global side-output (offline-RL corpus).
    pub fn append_global_jsonl<T: Serialize>(&self, name: &str, value: &T) -> CoreResult<()> {
        let path = self.global_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        use std::io::Write;
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> CoreError {
    CoreError::Persistence {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Write-to-temp plus atomic rename, retried once on transient failure.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    match try_atomic_write(path, bytes) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(path = %path.display(), error = %first, "artifact write failed, retrying once");
            try_atomic_write(path, bytes).map_err(|e| persistence_error(path, e))
        }
    }
}

fn try_atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

pub fn write_parquet_file<T: Serialize + DeserializeOwned>(path: &Path, items: &[T]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let fields = Vec::<FieldRef>::from_type::<T>(TracingOptions::default())
        .map_err(|e| persistence_error(path, e))?;
    let batch = serde_arrow::to_record_batch(&fields, &items)
        .map_err(|e| persistence_error(path, e))?;
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp)?;
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), None).map_err(|e| persistence_error(path, e))?;
    writer.write(&batch).map_err(|e| persistence_error(path, e))?;
    writer.close().map_err(|e| persistence_error(path, e))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_parquet_file<T: DeserializeOwned>(path: &Path) -> CoreResult<Vec<T>> {
    if !path.exists() {
        return Err(CoreError::MissingArtifact(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| persistence_error(path, e))?
        .build()
        .map_err(|e| persistence_error(path, e))?;
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| persistence_error(path, e))?;
        let mut items: Vec<T> =
            serde_arrow::from_record_batch(&batch).map_err(|e| persistence_error(path, e))?;
        out.append(&mut items);
    }
    Ok(out)
}
