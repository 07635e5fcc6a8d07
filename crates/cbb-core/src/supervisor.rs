use std::{future::Future, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{ingest::IngestionLoop, state::StateStore, Result};

/// Keep a long-running task alive until `shutdown` fires.
///
/// `make` starts one run of the task. Whenever a run ends with an error, a
/// panic, or returns while shutdown has not been requested, the failure is
/// logged and a fresh run is started after `cooldown`. There is no restart
/// limit. Returns the number of restarts performed.
pub async fn run_forever<F, Fut>(mut make: F, cooldown: Duration, shutdown: CancellationToken) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut restarts = 0u64;
    loop {
        let outcome = tokio::spawn(make()).await;

        if shutdown.is_cancelled() {
            if let Ok(Err(e)) = &outcome {
                tracing::error!("ingestion ended with error during shutdown: {e}");
            }
            break;
        }

        match outcome {
            Ok(Ok(())) => tracing::error!("ingestion loop returned unexpectedly; restarting"),
            Ok(Err(e)) => tracing::error!("ingestion loop failed: {e}; restarting"),
            Err(e) if e.is_panic() => tracing::error!("ingestion loop panicked; restarting"),
            Err(e) => tracing::error!("ingestion task aborted: {e}; restarting"),
        }

        tokio::select! {
          _ = tokio::time::sleep(cooldown) => {}
          _ = shutdown.cancelled() => break,
        }
        restarts += 1;
        tracing::info!(restarts, "restarting ingestion loop");
    }
    restarts
}

/// Run `ingest` under [`run_forever`] with the state autosave beside it.
///
/// Autosave has its own stop signal, raised only once the last loop run has
/// returned: the final state flush then covers every event dispatched before
/// the loop's final cursor save.
pub async fn run_ingestion(
    ingest: Arc<IngestionLoop>,
    store: Arc<StateStore>,
    cooldown: Duration,
    flush_every: Duration,
    shutdown: CancellationToken,
) -> u64 {
    let autosave_stop = CancellationToken::new();
    let autosave = store.spawn_autosave(flush_every, autosave_stop.clone());

    let token = shutdown.clone();
    let restarts = run_forever(
        move || {
            let ingest = ingest.clone();
            let token = token.clone();
            async move { ingest.run(&token).await }
        },
        cooldown,
        shutdown,
    )
    .await;

    autosave_stop.cancel();
    if let Err(e) = autosave.await {
        tracing::error!("state autosave task failed: {e}");
    }
    restarts
}
