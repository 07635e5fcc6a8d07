use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use cbb_core::{
    classifier::KeywordClassifier,
    config::Config,
    cursor::CursorStore,
    dispatch::Dispatcher,
    ingest::{IngestConfig, IngestionLoop},
    responder::Responder,
    state::StateStore,
    supervisor,
};
use cbb_telegram::TelegramApi;

mod health;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cbb_core::logging::init("cbb")?;

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Exiting would make most hosts restart us in a tight loop.
            tracing::error!("cannot start: {e}");
            shutdown_signal().await;
            return Ok(());
        }
    };

    let shutdown = CancellationToken::new();

    let api = Arc::new(TelegramApi::from_config(&cfg)?);
    match api.get_me().await {
        Ok(me) => tracing::info!(
            username = me.get("username").and_then(|v| v.as_str()).unwrap_or("?"),
            "bot identity confirmed"
        ),
        Err(e) => tracing::warn!("getMe failed, continuing anyway: {e}"),
    }

    let store = Arc::new(StateStore::open(&cfg.state_file, cfg.history_cap));

    let responder = Arc::new(Responder::new(
        store.clone(),
        Arc::new(KeywordClassifier::new()),
        cfg.allowed_users.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(api.clone(), responder.clone(), responder));
    let ingest = Arc::new(IngestionLoop::new(
        api,
        dispatcher,
        CursorStore::new(&cfg.cursor_file),
        IngestConfig::from_config(&cfg),
    ));

    let health = match cfg.health_addr {
        Some(addr) => {
            let listener = health::bind(addr)
                .await
                .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = health::serve(listener, token).await {
                    tracing::error!("health endpoint failed: {e}");
                }
            }))
        }
        None => None,
    };

    let supervised = tokio::spawn(supervisor::run_ingestion(
        ingest,
        store,
        cfg.restart_cooldown,
        cfg.state_flush_interval,
        shutdown.clone(),
    ));

    tracing::info!("bot running; press Ctrl+C to stop");
    shutdown_signal().await;
    shutdown.cancel();

    match supervised.await {
        Ok(restarts) => tracing::info!(restarts, "ingestion stopped"),
        Err(e) => tracing::error!("supervisor task failed: {e}"),
    }
    if let Some(h) = health {
        if let Err(e) = h.await {
            tracing::error!("health task failed: {e}");
        }
    }

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
