use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Response};

use crate::api::AppState;

/// Application metrics collection
#[derive(Debug, Clone)]
pub struct AppMetrics {
    // Engine metrics
    pub engine_ticks_total: IntCounter,
    pub engine_tick_duration: Histogram,
    pub engine_tick_failures_total: IntCounter,

    // Twin metrics
    pub trains_served: IntGauge,
    pub total_wait_minutes: Gauge,
    pub avg_exit_delay_minutes: Gauge,

    // Radar metrics
    pub risks_active: IntGauge,
    pub critical_risks_active: IntGauge,

    // Plan metrics
    pub plan_actions: IntGauge,
    pub plans_published_total: IntCounter,

    // Ingestion metrics
    pub events_ingested_total: IntCounter,
    pub ingest_failures_total: IntCounter,

    // Ledger metrics
    pub decisions_total: IntCounter,
    pub audit_completeness_pct: Gauge,

    pub registry: Registry,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let engine_ticks_total = IntCounter::with_opts(
            Opts::new("engine_ticks_total", "Total number of engine ticks executed")
        )?;
        let engine_tick_duration = Histogram::with_opts(
            HistogramOpts::new("engine_tick_duration_seconds", "Engine tick duration")
        )?;
        let engine_tick_failures_total = IntCounter::with_opts(
            Opts::new("engine_tick_failures_total", "Ticks aborted by component failures")
        )?;

        let trains_served = IntGauge::with_opts(
            Opts::new("trains_served", "Trains served by the latest replay")
        )?;
        let total_wait_minutes = Gauge::with_opts(
            Opts::new("total_wait_minutes", "Total enforced waiting minutes in the twin")
        )?;
        let avg_exit_delay_minutes = Gauge::with_opts(
            Opts::new("avg_exit_delay_minutes", "Average final-stop delay in minutes")
        )?;

        let risks_active = IntGauge::with_opts(
            Opts::new("risks_active", "Risks in the current radar horizon")
        )?;
        let critical_risks_active = IntGauge::with_opts(
            Opts::new("critical_risks_active", "Critical risks in the current radar horizon")
        )?;

        let plan_actions = IntGauge::with_opts(
            Opts::new("plan_actions", "Actions in the current recommended plan")
        )?;
        let plans_published_total = IntCounter::with_opts(
            Opts::new("plans_published_total", "Distinct plans published (post-hysteresis)")
        )?;

        let events_ingested_total = IntCounter::with_opts(
            Opts::new("events_ingested_total", "Event envelopes merged into the store")
        )?;
        let ingest_failures_total = IntCounter::with_opts(
            Opts::new("ingest_failures_total", "Adapter failures recorded by circuit breakers")
        )?;

        let decisions_total = IntCounter::with_opts(
            Opts::new("decisions_total", "Decisions appended to the audit ledger")
        )?;
        let audit_completeness_pct = Gauge::with_opts(
            Opts::new("audit_completeness_pct", "decisions_logged / recommendations * 100")
        )?;

        registry.register(Box::new(engine_ticks_total.clone()))?;
        registry.register(Box::new(engine_tick_duration.clone()))?;
        registry.register(Box::new(engine_tick_failures_total.clone()))?;
        registry.register(Box::new(trains_served.clone()))?;
        registry.register(Box::new(total_wait_minutes.clone()))?;
        registry.register(Box::new(avg_exit_delay_minutes.clone()))?;
        registry.register(Box::new(risks_active.clone()))?;
        registry.register(Box::new(critical_risks_active.clone()))?;
        registry.register(Box::new(plan_actions.clone()))?;
        registry.register(Box::new(plans_published_total.clone()))?;
        registry.register(Box::new(events_ingested_total.clone()))?;
        registry.register(Box::new(ingest_failures_total.clone()))?;
        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(audit_completeness_pct.clone()))?;

        Ok(Self {
            engine_ticks_total,
            engine_tick_duration,
            engine_tick_failures_total,
            trains_served,
            total_wait_minutes,
            avg_exit_delay_minutes,
            risks_active,
            critical_risks_active,
            plan_actions,
            plans_published_total,
            events_ingested_total,
            ingest_failures_total,
            decisions_total,
            audit_completeness_pct,
            registry,
        })
    }

    /// Refresh gauges from the latest engine snapshot.
    pub fn observe_snapshot(&self, snapshot: &crate::engine::EngineSnapshot) {
        self.trains_served.set(snapshot.sim_kpis.trains_served as i64);
        self.total_wait_minutes.set(snapshot.sim_kpis.total_wait_min);
        self.avg_exit_delay_minutes.set(snapshot.sim_kpis.avg_exit_delay_min);
        self.risks_active.set(snapshot.radar_kpis.total_risks as i64);
        self.critical_risks_active.set(snapshot.radar_kpis.critical as i64);
        self.plan_actions.set(snapshot.plan.actions.len() as i64);
    }
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler(
    State(state): State<AppState>,
) -> Result<Response<String>, StatusCode> {
    let snapshot = state.engine.snapshot().await;
    state.metrics.observe_snapshot(&snapshot);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.metrics.registry.gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let body = String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", encoder.format_type())
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Background task refreshing snapshot gauges periodically.
pub async fn metrics_updater(state: AppState, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));
    loop {
        interval.tick().await;
        let snapshot = state.engine.snapshot().await;
        state.metrics.observe_snapshot(&snapshot);
        let completeness = state
            .engine
            .ledger()
            .completeness(&state.engine.cfg.scope, &state.engine.cfg.date);
        state.metrics.audit_completeness_pct.set(completeness.completeness_pct);
        tracing::debug!("Metrics updated successfully");
    }
}
