use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    Headway,
    BlockCapacity,
    PlatformOverflow,
}

impl RiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskType::Headway => "headway",
            RiskType::BlockCapacity => "block_capacity",
            RiskType::PlatformOverflow => "platform_overflow",
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, RiskType::Headway | RiskType::BlockCapacity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Rank used for ordering; lower is more severe.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }

    /// Severity from minutes of lead time until the risk materialises.
    pub fn from_lead_min(minutes_to: f64) -> Self {
        if minutes_to <= 5.0 {
            Severity::Critical
        } else if minutes_to <= 30.0 {
            Severity::High
        } else if minutes_to <= 120.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// A predicted resource conflict within the radar horizon.
///
/// For headway risks `train_ids` is ordered [leader, follower].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    #[serde(rename = "type")]
    pub risk_type: RiskType,
    pub severity: Severity,
    pub lead_min: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    pub train_ids: Vec<String>,
    #[serde(default)]
    pub required_hold_min: f64,
}

impl Risk {
    /// Identifier of the contended resource (block or station).
    pub fn resource_ref(&self) -> &str {
        self.block_id
            .as_deref()
            .or(self.station_id.as_deref())
            .unwrap_or("")
    }

    /// The train the optimizer would act on by default.
    pub fn primary_train(&self) -> Option<&str> {
        match self.risk_type {
            RiskType::Headway if self.train_ids.len() > 1 => {
                self.train_ids.get(1).map(|s| s.as_str())
            }
            _ => self.train_ids.last().map(|s| s.as_str()),
        }
    }
}

/// Quick what-if estimate attached to each risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationPreview {
    pub risk_index: usize,
    #[serde(rename = "type")]
    pub risk_type: RiskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    pub train_ids: Vec<String>,
    pub hold_2min_resolves: bool,
    pub hold_5min_resolves: bool,
    pub required_hold_min: f64,
    pub eta_delta_min_2: f64,
    pub eta_delta_min_5: f64,
}

/// Risk density per time bucket and resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub ts_bucket: DateTime<Utc>,
    pub resource_type: String,
    pub resource_id: String,
    pub risk_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadarKpis {
    pub total_risks: u32,
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub avg_lead_min: f64,
    pub pct_with_preview: f64,
}

/// Independent verification of the post-enforcement twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskValidation {
    pub post_overlap_violations: u32,
    pub headway_violations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_min_lead_min: Option<f64>,
    pub ok_post_no_overlap: bool,
    pub ok_headway_enforced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_thresholds() {
        assert_eq!(Severity::from_lead_min(0.0), Severity::Critical);
        assert_eq!(Severity::from_lead_min(5.0), Severity::Critical);
        assert_eq!(Severity::from_lead_min(5.1), Severity::High);
        assert_eq!(Severity::from_lead_min(30.0), Severity::High);
        assert_eq!(Severity::from_lead_min(120.0), Severity::Medium);
        assert_eq!(Severity::from_lead_min(121.0), Severity::Low);
    }

    #[test]
    fn test_risk_type_serialization() {
        assert_eq!(
            serde_json::to_string(&RiskType::PlatformOverflow).unwrap(),
            "\"platform_overflow\""
        );
        assert_eq!(serde_json::to_string(&RiskType::Headway).unwrap(), "\"headway\"");
    }
}
