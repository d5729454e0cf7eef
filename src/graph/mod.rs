//! Immutable section topology with O(1) lookups for the simulator.

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};

use crate::error::{CoreError, CoreResult};
use crate::models::{BlockRecord, StationRecord};

/// Per-block attributes used during replay and detection.
#[derive(Debug, Clone, Copy)]
pub struct BlockAttr {
    pub min_run_time: f64,
    pub headway: f64,
    pub capacity: u32,
    pub headway_peak_p90: Option<f64>,
    pub headway_offpeak_p90: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct StationAttr {
    pub platforms: u32,
    pub min_dwell_min: f64,
    pub route_setup_min: f64,
}

/// Defaults applied when a station referenced by events is absent from the
/// nodes table.
pub const STATION_FALLBACK: StationAttr = StationAttr {
    platforms: 1,
    min_dwell_min: 2.0,
    route_setup_min: 0.5,
};

/// Loaded and validated (nodes, edges) tables. Read-only after construction.
#[derive(Debug, Clone)]
pub struct SectionGraph {
    nodes: Vec<StationRecord>,
    edges: Vec<BlockRecord>,
    block_attr: HashMap<String, BlockAttr>,
    pair_to_block: HashMap<(String, String), String>,
    station_attr: HashMap<String, StationAttr>,
}

impl SectionGraph {
    pub fn load(nodes: Vec<StationRecord>, edges: Vec<BlockRecord>) -> CoreResult<Self> {
        let mut station_attr = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            if node.platforms < 1 {
                return Err(CoreError::BadTopology(format!(
                    "station {} has no platforms",
                    node.station_id
                )));
            }
            if node.min_dwell_min < 0.0 || node.route_setup_min < 0.0 {
                return Err(CoreError::BadTopology(format!(
                    "station {} has negative dwell or route setup",
                    node.station_id
                )));
            }
            station_attr.insert(
                node.station_id.clone(),
                StationAttr {
                    platforms: node.platforms,
                    min_dwell_min: node.min_dwell_min,
                    route_setup_min: node.route_setup_min,
                },
            );
        }

        let mut block_attr = HashMap::with_capacity(edges.len());
        let mut pair_to_block = HashMap::with_capacity(edges.len());
        for edge in &edges {
            if !station_attr.contains_key(&edge.u) || !station_attr.contains_key(&edge.v) {
                return Err(CoreError::BadTopology(format!(
                    "block {} references unknown endpoints ({}, {})",
                    edge.block_id, edge.u, edge.v
                )));
            }
            if edge.capacity < 1 {
                return Err(CoreError::BadTopology(format!(
                    "block {} has capacity {}",
                    edge.block_id, edge.capacity
                )));
            }
            if edge.min_run_time <= 0.0 {
                return Err(CoreError::BadTopology(format!(
                    "block {} has non-positive min_run_time",
                    edge.block_id
                )));
            }
            if edge.headway < 0.0 {
                return Err(CoreError::BadTopology(format!(
                    "block {} has negative headway",
                    edge.block_id
                )));
            }
            let previous = block_attr.insert(
                edge.block_id.clone(),
                BlockAttr {
                    min_run_time: edge.min_run_time,
                    headway: edge.headway,
                    capacity: edge.capacity,
                    headway_peak_p90: edge.headway_peak_p90,
                    headway_offpeak_p90: edge.headway_offpeak_p90,
                },
            );
            if previous.is_some() {
                return Err(CoreError::BadTopology(format!(
                    "duplicate block_id {}",
                    edge.block_id
                )));
            }
            pair_to_block.insert((edge.u.clone(), edge.v.clone()), edge.block_id.clone());
        }

        Ok(Self {
            nodes,
            edges,
            block_attr,
            pair_to_block,
            station_attr,
        })
    }

    pub fn nodes(&self) -> &[StationRecord] {
        &self.nodes
    }

    pub fn edges(&self) -> &[BlockRecord] {
        &self.edges
    }

    pub fn block_for_pair(&self, u: &str, v: &str) -> Option<&str> {
        self.pair_to_block
            .get(&(u.to_string(), v.to_string()))
            .map(|s| s.as_str())
    }

    pub fn has_pair(&self, u: &str, v: &str) -> bool {
        self.pair_to_block.contains_key(&(u.to_string(), v.to_string()))
    }

    pub fn block(&self, block_id: &str) -> Option<&BlockAttr> {
        self.block_attr.get(block_id)
    }

    pub fn block_headway(&self, block_id: &str) -> f64 {
        self.block_attr.get(block_id).map(|b| b.headway).unwrap_or(0.0)
    }

    pub fn block_capacity(&self, block_id: &str) -> u32 {
        self.block_attr.get(block_id).map(|b| b.capacity).unwrap_or(1)
    }

    /// Station attributes, falling back to defaults for unknown stations.
    pub fn station(&self, station_id: &str) -> StationAttr {
        self.station_attr
            .get(station_id)
            .copied()
            .unwrap_or(STATION_FALLBACK)
    }

    pub fn station_platforms(&self, station_id: &str) -> u32 {
        self.station(station_id).platforms
    }

    /// Headway in force on a block at a given entry time.
    ///
    /// Seasonal p90 overrides only ever tighten the base headway, so the
    /// base-headway safety invariant keeps holding under seasonality.
    pub fn effective_headway(&self, block_id: &str, at: DateTime<Utc>) -> f64 {
        let Some(attr) = self.block_attr.get(block_id) else {
            return 0.0;
        };
        let hour = at.hour();
        let peak = (7..10).contains(&hour) || (17..20).contains(&hour);
        let seasonal = if peak {
            attr.headway_peak_p90
        } else {
            attr.headway_offpeak_p90
        };
        match seasonal {
            Some(s) => attr.headway.max(s),
            None => attr.headway,
        }
    }
}
