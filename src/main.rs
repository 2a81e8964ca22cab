use anyhow::{Context, Result};
use clap::Parser;
use lookout::browser::ChromiumDriver;
use lookout::classify::{KeywordClassifier, LoginProfile};
use lookout::config::{self, Args};
use lookout::perception::PerceptionLoop;
use lookout::registry::RunRegistry;
use lookout::server::{self, AppState};
use lookout::snapshots::DiskSnapshotStore;
use lookout::vision::{VisionClient, VisionConfig};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn init_tracing(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir).context("failed to create log directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("lookout")
        .filename_suffix("log")
        .build(log_dir)
        .context("failed to open log file")?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before clap reads env-backed flags.
    let env_loaded = config::load_env_file("config.env");
    let args = Args::parse();
    init_tracing(&args.log_dir)?;
    if env_loaded {
        info!("loaded config.env");
    }

    let vision = VisionClient::new(VisionConfig::default())?;
    match vision.list_models().await {
        Ok(models) => info!(count = models.len(), "vision endpoint reachable"),
        Err(e) => warn!(error = %e, "vision endpoint unreachable; runs will fall back to task text"),
    }

    let login = LoginProfile::from_env();
    if login.is_some() {
        info!("login flow configured");
    }
    let classifier = KeywordClassifier::default().with_login(login);

    let registry = Arc::new(RunRegistry::new(args.registry()));
    let _reaper = registry.spawn_reaper(Duration::from_secs(30));

    let driver = Arc::new(ChromiumDriver::new(args.browser()));
    let mut runs = PerceptionLoop::new(Arc::clone(&registry), driver, Arc::new(vision), args.run_loop())
        .with_classifier(Arc::new(classifier));
    if let Some(dir) = &args.snapshot_dir {
        info!(dir = %dir.display(), "persisting screenshots");
        runs = runs.with_snapshot_store(Arc::new(DiskSnapshotStore::new(dir)));
    }

    let app = server::router(AppState { runs: Arc::new(runs) });
    let listener = tokio::net::TcpListener::bind(args.addr())
        .await
        .with_context(|| format!("failed to bind {}", args.addr()))?;
    info!(addr = %args.addr(), "lookout listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
