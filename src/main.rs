use anyhow::Result;
use image_gallery::{
    bootstrap,
    config::{AppConfig, Mode},
    logging,
    shutdown::shutdown_signal,
    supervisor::{Supervisor, SupervisorSettings, WorkerCommand},
    worker,
};

// Every process, supervisor or worker, runs a single-threaded runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let role = match mode {
        Mode::Worker { port } => format!("worker-{}", port),
        Mode::Supervise | Mode::Migrate | Mode::Reconcile => "supervisor".to_string(),
    };
    logging::init(cfg.log_dir.as_deref(), &role)?;

    match mode {
        Mode::Worker { port } => worker::run(&cfg, port).await,
        Mode::Migrate => {
            let services = bootstrap::open_services(&cfg).await?;
            bootstrap::run_migrations(&services).await
        }
        Mode::Reconcile => {
            let services = bootstrap::open_services(&cfg).await?;
            bootstrap::run_migrations(&services).await?;
            let report = bootstrap::run_reconcile(&services).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Mode::Supervise => supervise(cfg).await,
    }
}

async fn supervise(cfg: AppConfig) -> Result<()> {
    tracing::info!("Starting image-gallery with config: {:?}", cfg);

    // Migrate and repair before any worker serves; the supervisor keeps no
    // connection open afterwards.
    let services = bootstrap::prepare(&cfg).await?;
    services.repository.pool().close().await;
    drop(services);

    let supervisor = Supervisor::new(
        WorkerCommand::current_exe()?,
        SupervisorSettings::new(cfg.worker_ports()),
    );
    let report = supervisor.run(shutdown_signal()).await;
    tracing::info!(restarts = ?report.restarts, "Shutdown complete");
    Ok(())
}
