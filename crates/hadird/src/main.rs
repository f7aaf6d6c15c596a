use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod photo;
mod roster;
mod service;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("hadird starting");

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind_addr,
        db = %config.db_path.display(),
        uploads = %config.upload_dir.display(),
        threshold = config.match_threshold,
        inline_photos = config.inline_photos,
        "configuration loaded"
    );

    let store = store::Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;

    if let Some(path) = &config.roster_path {
        let roster = roster::Roster::load(path)
            .await
            .with_context(|| format!("failed to load roster {}", path.display()))?;
        let summary = roster.apply(&store).await?;
        tracing::info!(
            classes = summary.classes,
            students = summary.students,
            "roster imported"
        );
    }

    let photos = photo::PhotoStore::new(&config.upload_dir, config.inline_photos);
    let service = service::AttendanceService::new(
        store,
        photos,
        config.match_threshold,
        config.max_samples,
        config.max_image_bytes,
    );
    let app = api::router(service, config.max_body_bytes);

    tracing::info!(addr = %config.bind_addr, "hadird ready");
    axum::Server::try_bind(&config.bind_addr)
        .with_context(|| format!("failed to bind {}", config.bind_addr))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("hadird shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
