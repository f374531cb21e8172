//! vigil — resilience core daemon
//!
//! Wires the readiness coordinator, candidate ledger, model client and
//! cycle timer together and runs the periodic signal-generation loop
//! against a simulated portfolio.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vigil::agent::{HttpModelClient, ResponseValidator};
use vigil::config::AppConfig;
use vigil::domain::ReadinessEvent;
use vigil::health::{CandidateErrorManager, MetricsRegistry};
use vigil::persistence::{store::open_file_store, StateStore};
use vigil::readiness::ReadinessCoordinator;
use vigil::services::{CycleTimerService, TimerConfig};
use vigil::strategy::{SignalEngine, TechnicalRuleFallback};

mod sources;

const CYCLE_TIMER_ID: &str = "signal_generation";

#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Resilience core for an AI-assisted trading monitor")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Symbols to watch (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
    watchlist: Vec<String>,

    /// Start with the simulation loop active
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    init_tracing(&config);
    info!(watchlist = ?cli.watchlist, "vigil starting");

    // Durable state
    let store: Arc<dyn StateStore> = Arc::new(
        open_file_store(std::path::Path::new(&config.persistence.state_dir))
            .await
            .context("opening state store")?,
    );
    let metrics = Arc::new(MetricsRegistry::load(store.clone()).await);
    let errors = Arc::new(
        CandidateErrorManager::load(config.candidates.clone(), store, metrics.clone()).await,
    );
    errors.start_sweeper();

    // External collaborators
    let exchange = Arc::new(sources::PaperExchange::new(cli.watchlist.clone()));
    let model = Arc::new(HttpModelClient::new(config.model.clone()).context("building model client")?);
    if !model.is_configured() {
        warn!("model API key not configured; every cycle will use fallback signals");
    }

    // Readiness
    let coordinator = ReadinessCoordinator::new(config.readiness.clone(), exchange.clone());
    coordinator.subscribe(|status| {
        info!(state = %status.state, reason = ?status.reason, "readiness changed");
    });
    coordinator.dispatch(ReadinessEvent::Init);

    if cli.simulate {
        // Simulation starts once the first snapshot lands
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                if c.state() == vigil::domain::ReadinessState::Ready {
                    c.dispatch(ReadinessEvent::StartSimulation);
                    break;
                }
            }
        });
    }

    // Signal engine on the adaptive timer
    let engine = Arc::new(SignalEngine::new(
        config.cycle.clone(),
        cli.watchlist,
        Arc::clone(&coordinator),
        errors.clone(),
        metrics.clone(),
        model,
        exchange,
        ResponseValidator::new(config.validator.clone()),
        TechnicalRuleFallback::new(config.technical.clone()),
    ));

    let running = Arc::new(AtomicBool::new(true));
    let timers = CycleTimerService::new(TimerConfig::from_cycle(&config.cycle));
    {
        let engine = engine.clone();
        let running = running.clone();
        timers.start(
            CYCLE_TIMER_ID,
            move || running.load(Ordering::SeqCst),
            move || {
                let engine = engine.clone();
                async move { engine.run_cycle().await.map(|_| ()) }
            },
        );
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    running.store(false, Ordering::SeqCst);
    timers.stop_all();
    errors.stop_sweeper();
    coordinator.shutdown();
    metrics.persist().await.ok();

    info!("vigil stopped");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vigil.log");
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(appender))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
