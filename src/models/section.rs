use serde::{Deserialize, Serialize};

use super::GeoPoint;

/// Station row of the section graph (nodes table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRecord {
    pub station_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_platforms")]
    pub platforms: u32,
    #[serde(default = "default_dwell")]
    pub min_dwell_min: f64,
    #[serde(default = "default_route_setup")]
    pub route_setup_min: f64,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

impl StationRecord {
    pub fn geo(&self) -> Option<GeoPoint> {
        match (self.lat, self.lon) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
            _ => None,
        }
    }
}

/// Directed block row of the section graph (edges table).
///
/// One row per direction; `capacity` counts parallel tracks in that
/// direction. Optional peak/off-peak p90 headways override the base headway
/// seasonally, never below it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_id: String,
    pub u: String,
    pub v: String,
    pub min_run_time: f64,
    #[serde(default)]
    pub headway: f64,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub headway_peak_p90: Option<f64>,
    #[serde(default)]
    pub headway_offpeak_p90: Option<f64>,
}

fn default_platforms() -> u32 {
    1
}

fn default_dwell() -> f64 {
    2.0
}

fn default_route_setup() -> f64 {
    0.5
}

fn default_capacity() -> u32 {
    1
}
