//! Fixed-cadence runtime loop: ingest, recompute twin + radar + plan,
//! stabilise via hysteresis, publish an atomic snapshot.
//!
//! Single-threaded cooperative scheduling: adapters are ticked sequentially
//! and twin/radar/optimizer run serially within a tick. The only suspension
//! points are tick boundaries; a stop signal is honoured between ticks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::graph::SectionGraph;
use crate::ingest::{Adapter, EventStore};
use crate::ledger::Ledger;
use crate::models::{
    Action, AltOption, MitigationPreview, OptimizerAudit, Plan, PlanMetrics, RadarKpis, Risk,
    RiskValidation, SimKpis, TrainEvent, TrainPosition,
};
use crate::optimizer::{self, OptimizeContext, OptimizeParams};
use crate::policy_store::PolicyStore;
use crate::radar::{self, RadarParams};
use crate::store::{self, rows, ArtifactStore};
use crate::twin::{self, minutes, replay, ReplayOverrides};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub scope: String,
    pub date: String,
    pub cadence_sec: u64,
    pub sandbox: bool,
    pub horizon_min: i64,
    pub bucket_min: i64,
    pub epsilon: f64,
    pub use_ga: bool,
    /// Write per-tick artifacts; disabled in tests.
    pub persist_artifacts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scope: "all_india".to_string(),
            date: "2024-01-01".to_string(),
            cadence_sec: 120,
            sandbox: true,
            horizon_min: 60,
            bucket_min: 5,
            epsilon: 0.2,
            use_ga: false,
            persist_artifacts: true,
        }
    }
}

/// One published view of a tick. Readers always see a consistent tick via
/// atomic pointer replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub tick: u64,
    pub computed_at: Option<DateTime<Utc>>,
    pub positions: Vec<TrainPosition>,
    pub block_occupancy: Vec<crate::models::BlockOccupancy>,
    pub platform_occupancy: Vec<crate::models::PlatformOccupancy>,
    pub waiting_ledger: Vec<crate::models::WaitEntry>,
    pub sim_kpis: SimKpis,
    pub risks: Vec<Risk>,
    pub previews: Vec<MitigationPreview>,
    pub radar_kpis: RadarKpis,
    pub validation: Option<RiskValidation>,
    pub plan: Plan,
    pub plan_prev: Plan,
    pub alt_options: Vec<AltOption>,
    pub plan_metrics: PlanMetrics,
    pub optimizer_audit: Option<OptimizerAudit>,
}

pub struct RuntimeEngine {
    pub cfg: EngineConfig,
    graph: Arc<SectionGraph>,
    artifacts: ArtifactStore,
    policies: PolicyStore,
    ledger: Arc<Ledger>,
    events: Mutex<EventStore>,
    adapters: Mutex<Vec<Adapter>>,
    snapshot: RwLock<Arc<EngineSnapshot>>,
    last_error: RwLock<Option<String>>,
    tick_counter: AtomicU64,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl RuntimeEngine {
    pub fn new(
        cfg: EngineConfig,
        graph: Arc<SectionGraph>,
        initial_events: Vec<TrainEvent>,
        artifacts: ArtifactStore,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let policies = PolicyStore::new(artifacts.clone());
        let ledger = Arc::new(Ledger::new(artifacts.clone()));
        Self {
            cfg,
            graph,
            artifacts,
            policies,
            ledger,
            events: Mutex::new(EventStore::new(initial_events)),
            adapters: Mutex::new(Vec::new()),
            snapshot: RwLock::new(Arc::new(EngineSnapshot::default())),
            last_error: RwLock::new(None),
            tick_counter: AtomicU64::new(0),
            stop_tx,
            stop_rx,
        }
    }

    pub fn graph(&self) -> &SectionGraph {
        &self.graph
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn policy_store(&self) -> &PolicyStore {
        &self.policies
    }

    pub async fn add_adapter(&self, adapter: Adapter) {
        self.adapters.lock().await.push(adapter);
    }

    pub async fn snapshot(&self) -> Arc<EngineSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub async fn current_events(&self) -> Vec<TrainEvent> {
        self.events.lock().await.events_cloned()
    }

    /// Spawn the cadence loop; it exits when [`RuntimeEngine::stop`] fires
    /// between ticks.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(engine.cfg.cadence_sec.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stop_rx = engine.stop_rx.clone();
            info!(
                scope = %engine.cfg.scope,
                cadence_sec = engine.cfg.cadence_sec,
                sandbox = engine.cfg.sandbox,
                "runtime engine started"
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.tick_once().await {
                            error!(error = %e, "tick failed, previous snapshot retained");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            info!("runtime engine stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run one tick now. Component failures are caught here: the previous
    /// snapshot stays published and the error surfaces on the next read.
    pub async fn tick_once(&self) -> CoreResult<()> {
        self.tick_at(Utc::now()).await
    }

    /// Tick with an external clock, for tests and paced replays.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> CoreResult<()> {
        // 1. Ingest: tick each adapter sequentially, merge into the store.
        {
            let mut adapters = self.adapters.lock().await;
            let mut sink = self.events.lock().await;
            for adapter in adapters.iter_mut() {
                let envelopes = adapter.tick().await;
                let mut merged = 0usize;
                for envelope in &envelopes {
                    if sink.merge(envelope) {
                        merged += 1;
                    }
                }
                if merged > 0 {
                    info!(adapter = adapter.name(), merged, "ingested events");
                }
            }
        }

        // 2-4. Recompute and publish.
        let events = self.current_events().await;
        match self.recompute(&events, now).await {
            Ok(()) => {
                *self.last_error.write().await = None;
                Ok(())
            }
            Err(e) => {
                *self.last_error.write().await = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn recompute(&self, events: &[TrainEvent], now: DateTime<Utc>) -> CoreResult<()> {
        let sim = replay(events, &self.graph, &ReplayOverrides::default())?;

        let radar_params = RadarParams {
            t0: None,
            horizon_min: self.cfg.horizon_min,
            bucket_min: self.cfg.bucket_min,
        };
        let radar_out = radar::analyze(&self.graph, &sim, &radar_params);
        let validation = radar::validate(&sim.block_occupancy, &self.graph, &radar_out.risks);
        if !(validation.ok_post_no_overlap && validation.ok_headway_enforced) {
            return Err(CoreError::SafetyInvariantBroken(format!(
                "{} overlap(s), {} headway violation(s)",
                validation.post_overlap_violations, validation.headway_violations
            )));
        }

        // Policy and locks are re-read each tick; mid-tick updates wait.
        let policy = self.policies.load(&self.cfg.scope, &self.cfg.date)?;
        let locks = self.policies.load_locks(&self.cfg.scope, &self.cfg.date);
        let heat = self.policies.load_incident_heat(&self.cfg.scope, &self.cfg.date);

        let proposal = optimizer::propose(
            &OptimizeContext {
                graph: &self.graph,
                block_occupancy: &sim.block_occupancy,
                risks: &radar_out.risks,
                policy: &policy,
                locks: &locks,
                risk_heat: &heat,
            },
            &OptimizeParams {
                t0: radar_out.t0,
                horizon_min: self.cfg.horizon_min,
                use_ga: self.cfg.use_ga,
                epsilon: self.cfg.epsilon,
            },
        );

        let previous = self.snapshot().await;
        let (plan, plan_prev, plan_changed) =
            stabilise_plan(&previous.plan, proposal.plan, &previous.plan_prev);

        let tick = self.tick_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = EngineSnapshot {
            tick,
            computed_at: Some(now),
            positions: twin::snapshot::snapshot_positions(&sim.block_occupancy, now),
            block_occupancy: sim.block_occupancy.clone(),
            platform_occupancy: sim.platform_occupancy.clone(),
            waiting_ledger: sim.waiting_ledger.clone(),
            sim_kpis: sim.sim_kpis.clone(),
            risks: radar_out.risks.clone(),
            previews: radar_out.previews.clone(),
            radar_kpis: radar_out.kpis.clone(),
            validation: Some(validation.clone()),
            plan: plan.clone(),
            plan_prev: plan_prev.clone(),
            alt_options: proposal.alt_options.clone(),
            plan_metrics: proposal.metrics.clone(),
            optimizer_audit: Some(proposal.audit.clone()),
        };

        if self.cfg.persist_artifacts {
            // Transient persistence failure must not take the tick down; the
            // in-memory snapshot stays authoritative.
            if let Err(e) = self.persist(&sim, &radar_out, &validation, &snapshot, plan_changed, &policy) {
                warn!(error = %e, "artifact persistence failed, continuing on in-memory snapshot");
            }
        }

        *self.snapshot.write().await = Arc::new(snapshot);
        Ok(())
    }

    fn persist(
        &self,
        sim: &crate::models::SimResult,
        radar_out: &radar::RadarOutput,
        validation: &RiskValidation,
        snapshot: &EngineSnapshot,
        plan_changed: bool,
        policy: &crate::models::Policy,
    ) -> CoreResult<()> {
        let (scope, date) = (self.cfg.scope.as_str(), self.cfg.date.as_str());
        let artifacts = &self.artifacts;

        let block_rows: Vec<rows::BlockOccupancyRow> =
            sim.block_occupancy.iter().map(Into::into).collect();
        artifacts.write_parquet(scope, date, store::BLOCK_OCCUPANCY, &block_rows)?;
        let platform_rows: Vec<rows::PlatformOccupancyRow> =
            sim.platform_occupancy.iter().map(Into::into).collect();
        artifacts.write_parquet(scope, date, store::PLATFORM_OCCUPANCY, &platform_rows)?;
        let wait_rows: Vec<rows::WaitRow> = sim.waiting_ledger.iter().map(Into::into).collect();
        artifacts.write_parquet(scope, date, store::WAITING_LEDGER, &wait_rows)?;
        artifacts.write_json(scope, date, store::SIM_KPIS, &sim.sim_kpis)?;

        artifacts.write_json(scope, date, store::CONFLICT_RADAR, &radar_out.risks)?;
        let timeline_rows: Vec<rows::TimelineRow> = radar_out.timeline.iter().map(Into::into).collect();
        artifacts.write_parquet(scope, date, store::RISK_TIMELINE, &timeline_rows)?;
        artifacts.write_json(scope, date, store::MITIGATION_PREVIEW, &radar_out.previews)?;
        artifacts.write_json(scope, date, store::RISK_KPIS, &radar_out.kpis)?;
        artifacts.write_json(scope, date, store::RISK_VALIDATION, validation)?;

        if plan_changed {
            artifacts.write_json(scope, date, store::REC_PLAN, &snapshot.plan.actions)?;
            artifacts.write_json(scope, date, store::REC_PLAN_PREV, &snapshot.plan_prev.actions)?;
            artifacts.write_json(scope, date, store::ALT_OPTIONS, &snapshot.alt_options)?;
            artifacts.write_json(scope, date, store::PLAN_METRICS, &snapshot.plan_metrics)?;
            if let Some(audit) = &snapshot.optimizer_audit {
                artifacts.write_json(scope, date, store::AUDIT_LOG, audit)?;
            }
        }

        let il = crate::learn::build_il_examples(
            &radar_out.risks,
            &snapshot.plan.actions,
            &self.graph,
            &sim.block_occupancy,
            policy,
        );
        artifacts.write_parquet(scope, date, store::IL_TRAINING, &il)?;
        Ok(())
    }

    /// Sandbox-gated action application. Live mode is a placeholder; there
    /// is no dispatch channel here.
    pub async fn apply_action(
        &self,
        action_id: &str,
        modifiers: Option<serde_json::Value>,
    ) -> serde_json::Value {
        let snapshot = self.snapshot().await;
        let known = snapshot
            .plan
            .actions
            .iter()
            .any(|a| a.action_id.as_deref() == Some(action_id));
        if !known {
            return serde_json::json!({"status": "unknown_action", "applied": false});
        }
        if self.cfg.sandbox {
            return serde_json::json!({
                "status": "sandbox",
                "applied": false,
                "action_id": action_id,
                "modifiers": modifiers,
            });
        }
        serde_json::json!({"status": "ok", "applied": true, "action_id": action_id})
    }

    /// Inject a +delay disruption at (train, station) and recompute.
    pub async fn inject_disruption(
        &self,
        train_id: &str,
        station_id: &str,
        delay_min: f64,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        {
            let mut sink = self.events.lock().await;
            let mut events = sink.events_cloned();
            let mut touched = false;
            for event in events
                .iter_mut()
                .filter(|e| e.train_id == train_id && e.station_id == station_id)
            {
                if let Some(dep) = event.sched_dep {
                    event.sched_dep = Some(dep + minutes(delay_min));
                }
                if let Some(dep) = event.act_dep {
                    event.act_dep = Some(dep + minutes(delay_min));
                }
                touched = true;
            }
            if !touched {
                return Err(CoreError::InputDefect(format!(
                    "no event for train {train_id} at {station_id}"
                )));
            }
            sink.replace(events);
        }
        info!(train_id, station_id, delay_min, "disruption injected");
        self.tick_at(now).await
    }

    /// Swap the published plan with the retained previous plan.
    pub async fn revert_plan(&self) -> Plan {
        let mut guard = self.snapshot.write().await;
        let mut snapshot = (**guard).clone();
        std::mem::swap(&mut snapshot.plan, &mut snapshot.plan_prev);
        let reverted = snapshot.plan.clone();
        *guard = Arc::new(snapshot);
        drop(guard);
        if self.cfg.persist_artifacts {
            let snapshot = self.snapshot().await;
            let _ = self.artifacts.write_json(
                &self.cfg.scope,
                &self.cfg.date,
                store::REC_PLAN,
                &snapshot.plan.actions,
            );
            let _ = self.artifacts.write_json(
                &self.cfg.scope,
                &self.cfg.date,
                store::REC_PLAN_PREV,
                &snapshot.plan_prev.actions,
            );
        }
        info!(plan_version = %reverted.plan_version, "plan reverted");
        reverted
    }
}

/// Hysteresis: reorder the new plan so actions already in the previous plan
/// come first; when the action set is identical, keep the previous plan
/// object untouched so nothing re-emits downstream.
fn stabilise_plan(previous: &Plan, proposed: Plan, previous_prev: &Plan) -> (Plan, Plan, bool) {
    let prev_set: HashSet<String> = previous
        .actions
        .iter()
        .map(|a| a.canonical_json())
        .collect();
    let new_set: HashSet<String> = proposed
        .actions
        .iter()
        .map(|a| a.canonical_json())
        .collect();

    if prev_set == new_set && !previous.plan_version.is_empty() {
        return (previous.clone(), previous_prev.clone(), false);
    }

    let (kept, fresh): (Vec<Action>, Vec<Action>) = proposed
        .actions
        .into_iter()
        .partition(|a| prev_set.contains(&a.canonical_json()));
    let mut ordered = kept;
    ordered.extend(fresh);
    (Plan::new(ordered), previous.clone(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stabilise_identical_set_suppresses_reemission() {
        let a = Action::hold("T1", "S1", 2.0);
        let b = Action::hold("T2", "S1", 3.0);
        let previous = Plan::new(vec![a.clone(), b.clone()]);
        let proposed = Plan::new(vec![b.clone(), a.clone()]);
        let (plan, _, changed) = stabilise_plan(&previous, proposed, &Plan::default());
        assert!(!changed);
        assert_eq!(plan.plan_version, previous.plan_version);
    }

    #[test]
    fn test_stabilise_orders_retained_actions_first() {
        let a = Action::hold("T1", "S1", 2.0);
        let b = Action::hold("T2", "S1", 3.0);
        let c = Action::hold("T3", "S2", 2.0);
        let previous = Plan::new(vec![b.clone()]);
        let proposed = Plan::new(vec![a.clone(), c.clone(), b.clone()]);
        let (plan, prev, changed) = stabilise_plan(&previous, proposed, &Plan::default());
        assert!(changed);
        assert_eq!(plan.actions[0].train_id, "T2");
        assert_eq!(prev.plan_version, previous.plan_version);
    }
}
