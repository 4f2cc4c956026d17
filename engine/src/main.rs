mod adapter;
mod api;
mod config;
mod controller;
mod db;
mod error;
mod media;
mod playlist;
mod schedule;
mod scheduler;
mod status;

use std::sync::Arc;

use tracing::{info, warn};

use crate::adapter::{Adapters, MpvAdapter, VlcAdapter};
use crate::api::AppState;
use crate::config::EngineConfig;
use crate::controller::PlayerController;
use crate::db::Db;
use crate::media::MediaLibrary;
use crate::playlist::PlaylistStore;
use crate::schedule::ScheduleStore;
use crate::scheduler::{LocalClock, ScheduleEngine};
use crate::status::StatusCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = EngineConfig::from_env();
    let clock = cfg.utc_offset.map_or(LocalClock::Host, LocalClock::Fixed);
    info!("schedules run on {clock}");

    let version = env!("CARGO_PKG_VERSION").to_string();

    let db = Db::open(&cfg.db_path).await?;
    info!("database at {}", db.path().display());

    let media = MediaLibrary::new(&cfg.media_dir);
    if !media.root().is_dir() {
        warn!("media dir {} does not exist yet", media.root().display());
    }
    let playlists = PlaylistStore::new(db.clone(), media);
    let schedules = ScheduleStore::new(db.clone());

    let adapters = Adapters::new()
        .with(Arc::new(VlcAdapter::new(&cfg.vlc, cfg.adapter_timeout)?))
        .with(Arc::new(MpvAdapter::new(&cfg.mpv, cfg.adapter_timeout)));

    // The persisted choice wins over the configured default.
    let initial = match db.load_active_backend().await {
        Ok(Some(kind)) => kind,
        Ok(None) => cfg.default_backend,
        Err(e) => {
            warn!("reading the active backend failed, using {}: {e}", cfg.default_backend);
            cfg.default_backend
        }
    };
    info!("active backend: {initial}");

    let controller = Arc::new(PlayerController::new(
        adapters.clone(),
        playlists.clone(),
        db.clone(),
        initial,
        cfg.adapter_timeout,
    )?);

    let cache = Arc::new(StatusCache::new(
        adapters,
        controller.subscribe_active(),
        cfg.poll_interval,
        cfg.adapter_timeout,
    ));
    tokio::spawn(cache.clone().run());

    let engine = Arc::new(ScheduleEngine::new(
        controller.clone(),
        schedules.clone(),
        playlists.clone(),
        clock,
        cfg.schedule_tick,
    ));
    tokio::spawn(engine.clone().run());

    let state = AppState { version, controller, cache, engine, schedules, playlists };
    let app = api::build_router(state);

    info!("signage engine starting on http://{}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
