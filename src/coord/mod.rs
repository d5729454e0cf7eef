//! Boundary coordination between two adjacent scopes.
//!
//! Computes holds in scope A that align arrivals at a shared boundary
//! station with the earliest departure slot observed in scope B.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{Action, BlockOccupancy};
use crate::twin::minutes_between;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub actions: Vec<Action>,
    pub details: serde_json::Value,
}

pub fn coordinate(
    occupancy_a: &[BlockOccupancy],
    occupancy_b: &[BlockOccupancy],
    boundary_station: &str,
) -> HandshakeResult {
    // Last block into the boundary per train in A.
    let mut arrivals: BTreeMap<&str, &BlockOccupancy> = BTreeMap::new();
    for window in occupancy_a.iter().filter(|w| w.v == boundary_station) {
        arrivals
            .entry(&window.train_id)
            .and_modify(|w| {
                if window.exit_time > w.exit_time {
                    *w = window;
                }
            })
            .or_insert(window);
    }

    // Earliest departure out of the boundary in B.
    let earliest_dep = occupancy_b
        .iter()
        .filter(|w| w.u == boundary_station)
        .map(|w| w.entry_time)
        .min();

    let Some(earliest_dep) = earliest_dep else {
        return HandshakeResult {
            actions: Vec::new(),
            details: serde_json::json!({"note": "no departures in B"}),
        };
    };

    let candidates = arrivals.len();
    let mut actions = Vec::new();
    for (train_id, window) in arrivals {
        if window.exit_time <= earliest_dep {
            continue;
        }
        let hold_min = minutes_between(window.exit_time, earliest_dep);
        if hold_min <= 0.0 {
            continue;
        }
        let mut action = Action::hold(train_id, window.u.clone(), (hold_min * 10.0).round() / 10.0);
        action.reason = Some("boundary_handshake".to_string());
        action.station_id = Some(boundary_station.to_string());
        action.why = Some(format!("Align arrival into boundary {boundary_station}"));
        actions.push(action);
    }

    HandshakeResult {
        actions,
        details: serde_json::json!({
            "earliest_dep_B": earliest_dep.to_rfc3339(),
            "candidates": candidates,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OccupancySource;

    fn window(train: &str, u: &str, v: &str, entry: &str, exit: &str) -> BlockOccupancy {
        BlockOccupancy {
            train_id: train.to_string(),
            block_id: format!("{u}-{v}"),
            u: u.to_string(),
            v: v.to_string(),
            entry_time: entry.parse().unwrap(),
            exit_time: exit.parse().unwrap(),
            headway_applied_min: 0.0,
            source: OccupancySource::Scheduled,
        }
    }

    #[test]
    fn test_handshake_holds_late_arrivals() {
        let a = vec![
            window("T1", "S1", "SB", "2024-01-01T08:00:00Z", "2024-01-01T08:10:00Z"),
            window("T2", "S1", "SB", "2024-01-01T08:05:00Z", "2024-01-01T08:20:00Z"),
        ];
        let b = vec![window(
            "T9", "SB", "S5", "2024-01-01T08:12:00Z", "2024-01-01T08:25:00Z",
        )];
        let result = coordinate(&a, &b, "SB");
        // T1 arrives before the earliest B departure, T2 after.
        assert_eq!(result.actions.len(), 1);
        let hold = &result.actions[0];
        assert_eq!(hold.train_id, "T2");
        assert_eq!(hold.at_station.as_deref(), Some("S1"));
        assert!((hold.minutes.unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_handshake_without_departures() {
        let a = vec![window("T1", "S1", "SB", "2024-01-01T08:00:00Z", "2024-01-01T08:10:00Z")];
        let result = coordinate(&a, &[], "SB");
        assert!(result.actions.is_empty());
        assert_eq!(result.details["note"], "no departures in B");
    }
}
