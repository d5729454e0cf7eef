mod common;

use std::collections::HashMap;

use common::{s1_events, s1_graph};
use railops_backend::ledger::{DecisionRequest, Ledger, TransitionContext};
use railops_backend::models::{Action, Decision, LocksState, Policy};
use railops_backend::optimizer::{propose, OptimizeContext, OptimizeParams};
use railops_backend::radar::{analyze, RadarParams};
use railops_backend::store::{self, ArtifactStore};
use railops_backend::twin::{replay, ReplayOverrides};

const SCOPE: &str = "test_section";
const DATE: &str = "2024-01-01";

fn request(action: Action, decision: Decision, role: &str) -> DecisionRequest {
    DecisionRequest {
        scope: SCOPE.to_string(),
        date: DATE.to_string(),
        who: "controller1".to_string(),
        role: role.to_string(),
        action,
        decision,
        reason: Some("test".to_string()),
        modified: None,
    }
}

#[test]
fn test_trail_is_append_only_and_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let ledger = Ledger::new(store.clone());

    let first = ledger
        .append(request(Action::hold("T2", "S1", 3.0), Decision::Apply, "SC"), None)
        .unwrap();
    let trail_after_one = ledger.trail(SCOPE, DATE);
    assert_eq!(trail_after_one.len(), 1);

    let _second = ledger
        .append(request(Action::hold("T1", "S1", 2.0), Decision::Dismiss, "SC"), None)
        .unwrap();
    let trail = ledger.trail(SCOPE, DATE);
    assert_eq!(trail.len(), 2);

    // the first entry is byte-identical after the second append
    assert_eq!(trail[0].ts, first.ts);
    assert_eq!(trail[0].who, first.who);
    assert_eq!(trail[0].action_id, first.action_id);
    assert_eq!(trail[0].decision, first.decision);
    assert_eq!(
        serde_json::to_string(&trail[0].action).unwrap(),
        serde_json::to_string(&first.action).unwrap()
    );
}

#[test]
fn test_action_id_and_plan_version_populated() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());

    // a current plan exists on disk
    let plan_actions = vec![Action::hold("T2", "S1", 3.0).with_id()];
    store.write_json(SCOPE, DATE, store::REC_PLAN, &plan_actions).unwrap();

    let ledger = Ledger::new(store);
    let entry = ledger
        .append(request(Action::hold("T2", "S1", 3.0), Decision::Apply, "SC"), None)
        .unwrap();
    assert_eq!(entry.action_id.len(), 40);
    assert_eq!(entry.plan_version.len(), 40);
    // derived id matches the plan's stored action id
    assert_eq!(Some(entry.action_id.as_str()), plan_actions[0].action_id.as_deref());
}

#[test]
fn test_feedback_mirror_grows_with_decisions() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let ledger = Ledger::new(store.clone());

    ledger
        .append(request(Action::hold("T2", "S1", 3.0), Decision::Apply, "SC"), None)
        .unwrap();
    ledger
        .append(request(Action::hold("T2", "S1", 3.0), Decision::Ack, "CREW"), None)
        .unwrap();

    let mirror: Vec<railops_backend::models::FeedbackRecord> =
        store.read_parquet(SCOPE, DATE, store::FEEDBACK).unwrap();
    assert_eq!(mirror.len(), 2);
    assert_eq!(mirror[0].decision, "APPLY");
    assert_eq!(mirror[1].decision, "ACK");
    assert_eq!(mirror[0].action_id, mirror[1].action_id);
}

#[test]
fn test_completeness_ratio() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let plan_actions = vec![
        Action::hold("T2", "S1", 3.0).with_id(),
        Action::hold("T3", "S2", 2.0).with_id(),
    ];
    store.write_json(SCOPE, DATE, store::REC_PLAN, &plan_actions).unwrap();

    let ledger = Ledger::new(store);
    ledger
        .append(request(Action::hold("T2", "S1", 3.0), Decision::Apply, "SC"), None)
        .unwrap();

    let completeness = ledger.completeness(SCOPE, DATE);
    assert_eq!(completeness.recommendations, 2);
    assert_eq!(completeness.decisions_logged, 1);
    assert!((completeness.completeness_pct - 50.0).abs() < 1e-9);
}

#[test]
fn test_accepted_hold_emits_rl_transition() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let ledger = Ledger::new(store.clone());

    let graph = s1_graph();
    let events = s1_events();
    let sim = replay(&events, &graph, &ReplayOverrides::default()).unwrap();
    let radar = analyze(&graph, &sim, &RadarParams::default());
    let policy = Policy::default();
    let locks = LocksState::default();
    let proposal = propose(
        &OptimizeContext {
            graph: &graph,
            block_occupancy: &sim.block_occupancy,
            risks: &radar.risks,
            policy: &policy,
            locks: &locks,
            risk_heat: &HashMap::new(),
        },
        &OptimizeParams::default(),
    );
    let hold = proposal.plan.actions[0].clone();

    let context = TransitionContext {
        graph: &graph,
        occupancy: &sim.block_occupancy,
        risks: &radar.risks,
        previews: &radar.previews,
        policy: &policy,
    };
    ledger
        .append(request(hold, Decision::Apply, "SC"), Some(&context))
        .unwrap();

    let text = std::fs::read_to_string(store.global_path(store::OFFLINE_RL)).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    let transition: railops_backend::models::RlTransition =
        serde_json::from_str(lines[0]).unwrap();
    assert_eq!(transition.action.kind, "HOLD");
    assert_eq!(transition.info.train_id, "T2");
    assert!(transition.info.resolved);
    // resolved hold of 3 min with zero weights: 1.0 - 0.2 * 3
    assert!((transition.reward - 0.4).abs() < 1e-9);
}

#[test]
fn test_dismiss_emits_no_transition() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let ledger = Ledger::new(store.clone());

    let graph = s1_graph();
    let events = s1_events();
    let sim = replay(&events, &graph, &ReplayOverrides::default()).unwrap();
    let radar = analyze(&graph, &sim, &RadarParams::default());
    let policy = Policy::default();
    let context = TransitionContext {
        graph: &graph,
        occupancy: &sim.block_occupancy,
        risks: &radar.risks,
        previews: &radar.previews,
        policy: &policy,
    };
    ledger
        .append(
            request(Action::hold("T2", "S1", 3.0), Decision::Dismiss, "SC"),
            Some(&context),
        )
        .unwrap();
    assert!(!store.global_path(store::OFFLINE_RL).exists());
}
