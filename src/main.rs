use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, Command, MigrateArgs, MinioConfig, ProcessEnv, ServeArgs, ServerConfig, StatsArgs};
use services::{event_service::EventService, report_store::ReportStore, storage_service};
use std::{io::ErrorKind, process::ExitCode};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    config::load_env(args.env_file.as_ref())?;

    match args.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::Stats(stats_args) => stats(stats_args).await,
        Command::Migrate(migrate_args) => migrate(migrate_args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cfg = ServerConfig::from_env_and_args(&ProcessEnv, &args)?;
    let minio = MinioConfig::from_env(&ProcessEnv)?;

    tracing::info!(
        addr = %cfg.addr(),
        endpoint = %minio.endpoint(),
        bucket = %minio.bucket,
        "Starting raster-hook"
    );
    tracing::debug!("Server config: {:?}", cfg);

    // --- Report database ---
    let reports = ReportStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening database {}", cfg.database_url))?;
    reports.migrate().await.context("applying database schema")?;

    // --- Core service ---
    let store = storage_service::build_store(&minio)?;
    let mut events = EventService::new(
        store,
        reports,
        minio.bucket.clone(),
        cfg.raster_extensions.clone(),
        cfg.max_concurrency,
    )
    .with_max_pending(cfg.max_pending);
    if let Some(dir) = &cfg.scratch_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating scratch directory {}", dir.display()))?;
        events = events.with_scratch_dir(dir.clone());
    }
    let app = routes::routes::app(state::AppState::new(events.clone(), cfg.auth_token.clone()));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Drain accepted events ---
    let pending = events.pending();
    if pending > 0 {
        tracing::info!(pending, "Waiting for queued events to finish");
    }
    events.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Download one raster, print its report, and remove the scratch file.
async fn stats(args: StatsArgs) -> Result<()> {
    let mut minio = MinioConfig::from_env(&ProcessEnv)?;
    if let Some(bucket) = args.bucket {
        minio.bucket = bucket;
    }

    let store = storage_service::build_store(&minio)?;
    let downloaded = storage_service::download_object(&*store, &args.key, None)
        .await
        .with_context(|| format!("Failed to download file `{}`", args.key))?;

    let key = args.key.clone();
    let report = tokio::task::spawn_blocking(move || {
        services::raster_service::read_raster_report(downloaded.path(), &key)
    })
    .await
    .context("raster worker panicked")??;

    println!("{}", report.to_pretty_json()?);
    Ok(())
}

async fn migrate(args: MigrateArgs) -> Result<()> {
    let database_url = config::database_url(&ProcessEnv, args.database_url.as_ref());
    let reports = ReportStore::connect(&database_url)
        .await
        .with_context(|| format!("opening database {}", database_url))?;
    reports.migrate().await?;
    tracing::info!("Database migration complete.");
    Ok(())
}
