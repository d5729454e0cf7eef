//! Read-mostly policy and locks storage with update provenance.
//!
//! Consumers read the latest version at the start of each optimizer call;
//! an update mid-tick only takes effect on the next tick.

use std::collections::HashMap;

use chrono::Utc;
use tracing::info;

use crate::error::CoreResult;
use crate::models::{LocksState, Policy, Provenance};
use crate::store::{self, ArtifactStore};

#[derive(Debug, Clone)]
pub struct PolicyStore {
    store: ArtifactStore,
}

impl PolicyStore {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Latest policy, validated; absent or unreadable state falls back to
    /// defaults so the engine keeps running.
    pub fn load(&self, scope: &str, date: &str) -> CoreResult<Policy> {
        let policy: Policy = self.store.read_json_or(scope, date, store::POLICY_STATE);
        policy.validate()?;
        Ok(policy)
    }

    /// Persist a new policy version and stamp provenance.
    pub fn save(
        &self,
        scope: &str,
        date: &str,
        policy: &Policy,
        updated_by: &str,
    ) -> CoreResult<Provenance> {
        policy.validate()?;
        self.store.write_json(scope, date, store::POLICY_STATE, policy)?;
        let mut provenance: Provenance = self.store.read_json_or(scope, date, store::PROVENANCE);
        provenance.policy_version += 1;
        provenance.last_policy_update_ts = Some(Utc::now());
        provenance.updated_by = Some(updated_by.to_string());
        self.store.write_json(scope, date, store::PROVENANCE, &provenance)?;
        info!(scope, date, version = provenance.policy_version, updated_by, "policy updated");
        Ok(provenance)
    }

    pub fn provenance(&self, scope: &str, date: &str) -> Provenance {
        self.store.read_json_or(scope, date, store::PROVENANCE)
    }

    pub fn load_locks(&self, scope: &str, date: &str) -> LocksState {
        self.store.read_json_or(scope, date, store::LOCKS_STATE)
    }

    pub fn save_locks(&self, scope: &str, date: &str, locks: &LocksState) -> CoreResult<()> {
        self.store.write_json(scope, date, store::LOCKS_STATE, locks)
    }

    /// Per-block incident probabilities, empty when never produced.
    pub fn load_incident_heat(&self, scope: &str, date: &str) -> HashMap<String, f64> {
        self.store.read_json_or(scope, date, store::INCIDENT_HEAT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LockKind, ResourceLock};

    #[test]
    fn test_policy_roundtrip_with_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let policies = PolicyStore::new(ArtifactStore::new(dir.path()));

        let loaded = policies.load("sec", "2024-01-01").unwrap();
        assert_eq!(loaded.fairness_limits.max_holds_per_train, 2);

        let mut policy = Policy::default();
        policy.priority_weights.insert("12951".to_string(), 4.0);
        let prov = policies.save("sec", "2024-01-01", &policy, "om1").unwrap();
        assert_eq!(prov.policy_version, 1);
        assert_eq!(prov.updated_by.as_deref(), Some("om1"));

        let again = policies.save("sec", "2024-01-01", &policy, "om2").unwrap();
        assert_eq!(again.policy_version, 2);

        let loaded = policies.load("sec", "2024-01-01").unwrap();
        assert_eq!(loaded.priority_of("12951"), 4.0);
    }

    #[test]
    fn test_class_keyed_policy_rejected_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let policies = PolicyStore::new(ArtifactStore::new(dir.path()));
        let mut policy = Policy::default();
        policy.priority_weights.insert("Freight".to_string(), 1.0);
        assert!(policies.save("sec", "2024-01-01", &policy, "om1").is_err());
    }

    #[test]
    fn test_locks_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let policies = PolicyStore::new(ArtifactStore::new(dir.path()));
        let locks = LocksState {
            resource_locks: vec![ResourceLock {
                kind: LockKind::Platform,
                id: "S2".to_string(),
                locked: true,
            }],
            precedence_pins: vec![],
        };
        policies.save_locks("sec", "2024-01-01", &locks).unwrap();
        let back = policies.load_locks("sec", "2024-01-01");
        assert_eq!(back.locked_stations(), vec!["S2"]);
    }
}
