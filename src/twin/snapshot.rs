//! Per-train virtual positions computed from block occupancy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::models::{BlockOccupancy, TrainPosition};

use super::minutes_between;

/// Last-known position per train at time `t`.
///
/// Prefers the window containing `t`; otherwise the most recent window that
/// has already started (progress clamps to 100 %).
pub fn snapshot_positions(occupancy: &[BlockOccupancy], t: DateTime<Utc>) -> Vec<TrainPosition> {
    let mut best: BTreeMap<&str, &BlockOccupancy> = BTreeMap::new();
    for window in occupancy {
        if window.entry_time > t {
            continue;
        }
        best.entry(&window.train_id)
            .and_modify(|current| {
                if window.entry_time > current.entry_time {
                    *current = window;
                }
            })
            .or_insert(window);
    }
    best.into_values()
        .map(|window| {
            let duration = minutes_between(window.exit_time, window.entry_time).max(1.0);
            let progress = (minutes_between(t, window.entry_time) / duration).clamp(0.0, 1.0);
            TrainPosition {
                train_id: window.train_id.clone(),
                block_id: window.block_id.clone(),
                u: window.u.clone(),
                v: window.v.clone(),
                progress_pct: progress,
                eta_next: window.exit_time,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OccupancySource;

    fn window(train: &str, entry: &str, exit: &str) -> BlockOccupancy {
        BlockOccupancy {
            train_id: train.to_string(),
            block_id: "B1".to_string(),
            u: "S1".to_string(),
            v: "S2".to_string(),
            entry_time: entry.parse().unwrap(),
            exit_time: exit.parse().unwrap(),
            headway_applied_min: 0.0,
            source: OccupancySource::Scheduled,
        }
    }

    #[test]
    fn test_mid_block_progress() {
        let occ = vec![window("T1", "2024-01-01T08:00:00Z", "2024-01-01T08:10:00Z")];
        let positions = snapshot_positions(&occ, "2024-01-01T08:05:00Z".parse().unwrap());
        assert_eq!(positions.len(), 1);
        assert!((positions[0].progress_pct - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_future_windows_excluded() {
        let occ = vec![window("T1", "2024-01-01T09:00:00Z", "2024-01-01T09:10:00Z")];
        let positions = snapshot_positions(&occ, "2024-01-01T08:00:00Z".parse().unwrap());
        assert!(positions.is_empty());
    }

    #[test]
    fn test_completed_window_clamps() {
        let occ = vec![
            window("T1", "2024-01-01T08:00:00Z", "2024-01-01T08:10:00Z"),
            window("T1", "2024-01-01T08:15:00Z", "2024-01-01T08:25:00Z"),
        ];
        let positions = snapshot_positions(&occ, "2024-01-01T09:00:00Z".parse().unwrap());
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].block_id, "B1");
        assert!((positions[0].progress_pct - 1.0).abs() < 1e-9);
    }
}
