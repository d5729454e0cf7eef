use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use railops_backend::api::{self, AppState};
use railops_backend::apply;
use railops_backend::config::AppConfig;
use railops_backend::engine::{EngineConfig, RuntimeEngine};
use railops_backend::error::{CoreError, CoreResult};
use railops_backend::graph::SectionGraph;
use railops_backend::ingest::{Adapter, FileDropAdapter, PollingStatusAdapter};
use railops_backend::metrics::AppMetrics;
use railops_backend::models::{BlockRecord, Policy, StationRecord, TrainEvent};
use railops_backend::normalize::{self, StationNameMap};
use railops_backend::optimizer::{self, OptimizeContext, OptimizeParams};
use railops_backend::radar::{self, RadarParams};
use railops_backend::store::{self, rows, ArtifactStore};
use railops_backend::synthetic::{CorridorConfig, CorridorGenerator};
use railops_backend::twin::{replay, ReplayOverrides};

#[derive(Parser)]
#[command(name = "railops-backend", about = "Decision-support engine for railway traffic control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service with the fixed-cadence runtime engine.
    Serve {
        /// TOML configuration file; environment variables override defaults
        /// when absent.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Generate a synthetic corridor when no artifacts exist yet.
        #[arg(long, default_value_t = false)]
        demo: bool,
    },
    /// One-shot pipeline: normalise, replay, radar, optimize, report.
    Pipeline {
        #[arg(long)]
        scope: String,
        #[arg(long)]
        date: String,
        /// Raw events CSV.
        #[arg(long)]
        events: PathBuf,
        /// Stations CSV (station_id, platforms, min_dwell_min, ...).
        #[arg(long)]
        nodes: PathBuf,
        /// Blocks CSV (block_id, u, v, min_run_time, headway, capacity).
        #[arg(long)]
        edges: PathBuf,
        #[arg(long, default_value_t = 60)]
        horizon: i64,
        #[arg(long, default_value = "artifacts")]
        artifacts_root: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve { config, demo } => match serve(config, demo).await {
            Ok(()) => 0,
            Err(e) => {
                error!("serve failed: {e}");
                e.downcast_ref::<CoreError>().map(CoreError::exit_code).unwrap_or(1)
            }
        },
        Command::Pipeline {
            scope,
            date,
            events,
            nodes,
            edges,
            horizon,
            artifacts_root,
        } => match pipeline(&scope, &date, &events, &nodes, &edges, horizon, &artifacts_root) {
            Ok(()) => 0,
            Err(e) => {
                error!("pipeline failed: {e}");
                e.exit_code()
            }
        },
    };
    if code != 0 {
        std::process::exit(code);
    }
}

async fn serve(config_path: Option<PathBuf>, demo: bool) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();
    info!("Starting railops decision-support backend");

    let artifacts = ArtifactStore::new(&config.artifacts.root);
    let (graph, events) = load_or_generate_inputs(&config, &artifacts, demo)?;
    info!(
        stations = graph.nodes().len(),
        blocks = graph.edges().len(),
        events = events.len(),
        "section loaded"
    );

    let engine_cfg = EngineConfig {
        scope: config.engine.scope.clone(),
        date: config.engine.date.clone(),
        cadence_sec: config.engine.cadence_sec,
        sandbox: config.engine.sandbox,
        horizon_min: config.engine.horizon_min,
        bucket_min: config.engine.bucket_min,
        epsilon: config.engine.epsilon,
        use_ga: config.engine.use_ga,
        persist_artifacts: true,
    };
    let engine = Arc::new(RuntimeEngine::new(
        engine_cfg,
        Arc::new(graph),
        events,
        artifacts.clone(),
    ));

    if config.ingestion.enabled {
        let live_path = artifacts
            .scope_dir(&config.engine.scope, &config.engine.date)
            .join(&config.ingestion.live_events_file);
        engine.add_adapter(Adapter::FileDrop(FileDropAdapter::new(live_path))).await;
        engine
            .add_adapter(Adapter::Polling(PollingStatusAdapter::new(
                config.ingestion.poll_url.clone(),
                std::time::Duration::from_secs(config.ingestion.poll_timeout_seconds),
            )))
            .await;
        info!("Ingestion adapters registered");
    }

    let engine_task = engine.start();
    info!(cadence_sec = config.engine.cadence_sec, "Runtime engine loop started");

    let metrics = Arc::new(AppMetrics::new()?);
    let state = AppState {
        config: Arc::new(config.clone()),
        engine: engine.clone(),
        metrics: metrics.clone(),
    };

    if config.monitoring.prometheus_enabled {
        let metrics_state = state.clone();
        let interval = config.monitoring.metrics_collection_interval_seconds;
        tokio::spawn(async move {
            railops_backend::metrics::metrics_updater(metrics_state, interval).await;
        });
        info!("Background metrics collection started");
    }

    let app = api::router(state);
    let bind_address = config.server_bind_address();
    info!("Server starting on {bind_address}");
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    engine.stop();
    let _ = engine_task.await;
    Ok(())
}

fn load_or_generate_inputs(
    config: &AppConfig,
    artifacts: &ArtifactStore,
    demo: bool,
) -> CoreResult<(SectionGraph, Vec<TrainEvent>)> {
    let (scope, date) = (config.engine.scope.as_str(), config.engine.date.as_str());
    if artifacts.exists(scope, date, store::SECTION_NODES) {
        let nodes: Vec<StationRecord> = artifacts.read_parquet(scope, date, store::SECTION_NODES)?;
        let edges: Vec<BlockRecord> = artifacts.read_parquet(scope, date, store::SECTION_EDGES)?;
        let event_rows: Vec<rows::EventRow> =
            artifacts.read_parquet(scope, date, store::EVENTS_CLEAN)?;
        let events = event_rows
            .into_iter()
            .map(rows::EventRow::into_event)
            .collect::<CoreResult<Vec<_>>>()?;
        return Ok((SectionGraph::load(nodes, edges)?, events));
    }
    if !demo {
        return Err(CoreError::MissingArtifact(
            artifacts.artifact_path(scope, date, store::SECTION_NODES),
        ));
    }

    info!("No artifacts found, generating a synthetic demo corridor");
    let generator = CorridorGenerator::new();
    let (nodes, edges, events) = generator.generate(&CorridorConfig::default());
    artifacts.write_parquet(scope, date, store::SECTION_NODES, &nodes)?;
    artifacts.write_parquet(scope, date, store::SECTION_EDGES, &edges)?;
    let event_rows: Vec<rows::EventRow> = events.iter().map(Into::into).collect();
    artifacts.write_parquet(scope, date, store::EVENTS_CLEAN, &event_rows)?;
    Ok((SectionGraph::load(nodes, edges)?, events))
}

fn read_csv_records<T: serde::de::DeserializeOwned>(path: &PathBuf) -> CoreResult<Vec<T>> {
    if !path.exists() {
        return Err(CoreError::MissingArtifact(path.clone()));
    }
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| CoreError::InputDefect(format!("csv open {}: {e}", path.display())))?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| CoreError::InputDefect(format!("csv parse {}: {e}", path.display())))
}

#[allow(clippy::too_many_arguments)]
fn pipeline(
    scope: &str,
    date: &str,
    events_path: &PathBuf,
    nodes_path: &PathBuf,
    edges_path: &PathBuf,
    horizon: i64,
    artifacts_root: &PathBuf,
) -> CoreResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let artifacts = ArtifactStore::new(artifacts_root);

    // Normalise events
    let raw = normalize::load_raw_csv(events_path)?;
    let mut station_map = StationNameMap::load(artifacts.root().join("station_map.csv"))?;
    let (normalized, report) = normalize::to_train_events(&raw, &mut station_map)?;
    info!(
        rows_in = report.rows_in,
        rows_out = report.rows_out,
        skipped = report.skipped.len(),
        "events normalised"
    );

    // Graph
    let nodes: Vec<StationRecord> = read_csv_records(nodes_path)?;
    let edges: Vec<BlockRecord> = read_csv_records(edges_path)?;
    let graph = SectionGraph::load(nodes.clone(), edges.clone())?;

    // Twin
    let sim = replay(&normalized.events, &graph, &ReplayOverrides::default())?;
    info!(
        trains = sim.sim_kpis.trains_served,
        otp = sim.sim_kpis.otp_exit_pct,
        "replay complete"
    );

    // Radar
    let radar_out = radar::analyze(
        &graph,
        &sim,
        &RadarParams {
            horizon_min: horizon,
            ..Default::default()
        },
    );
    let validation = radar::validate(&sim.block_occupancy, &graph, &radar_out.risks);
    if !(validation.ok_post_no_overlap && validation.ok_headway_enforced) {
        return Err(CoreError::SafetyInvariantBroken(format!(
            "{} overlap(s), {} headway violation(s)",
            validation.post_overlap_violations, validation.headway_violations
        )));
    }

    // Optimizer
    let policy = Policy::default();
    let locks = railops_backend::models::LocksState::default();
    let heat = std::collections::HashMap::new();
    let proposal = optimizer::propose(
        &OptimizeContext {
            graph: &graph,
            block_occupancy: &sim.block_occupancy,
            risks: &radar_out.risks,
            policy: &policy,
            locks: &locks,
            risk_heat: &heat,
        },
        &OptimizeParams {
            horizon_min: horizon,
            ..Default::default()
        },
    );
    info!(
        actions = proposal.plan.actions.len(),
        strategy = %proposal.audit.strategy,
        "plan proposed"
    );

    // Apply-and-validate preview
    let apply_report = apply::apply_and_validate(
        &normalized.events,
        &graph,
        &proposal.plan.actions,
        radar_out.t0,
        horizon,
    )?;

    // Persist everything
    artifacts.write_parquet(scope, date, store::SECTION_NODES, &nodes)?;
    artifacts.write_parquet(scope, date, store::SECTION_EDGES, &edges)?;
    let event_rows: Vec<rows::EventRow> = normalized.events.iter().map(Into::into).collect();
    artifacts.write_parquet(scope, date, store::EVENTS_CLEAN, &event_rows)?;
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
    artifacts.write_json(scope, date, store::RISK_VALIDATION, &validation)?;
    artifacts.write_json(scope, date, store::REC_PLAN, &proposal.plan.actions)?;
    artifacts.write_json(scope, date, store::ALT_OPTIONS, &proposal.alt_options)?;
    artifacts.write_json(scope, date, store::PLAN_METRICS, &proposal.metrics)?;
    artifacts.write_json(scope, date, store::AUDIT_LOG, &proposal.audit)?;
    artifacts.write_json(scope, date, store::PLAN_APPLY_REPORT, &apply_report)?;

    info!(
        baseline_risks = apply_report.baseline_risks,
        applied_risks = apply_report.applied_risks,
        "pipeline artifacts written"
    );
    Ok(())
}
