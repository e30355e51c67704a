use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::CacheManager;
use crate::config::StagingConfig;
use crate::error::StagingError;
use crate::expiry::ExpiryNotifier;
use crate::lifecycle::JobLifecycleManager;
use crate::retrieval::{ArchiveFetcher, Regenerator};
use crate::store::CacheStore;

pub async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancellation: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StagingError>>,
{
    info!(daemon = name, interval_ms = interval.as_millis() as u64, "starting daemon");
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                info!(daemon = name, "daemon shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(err) = tick().await {
                    error!(daemon = name, error = %err, "sweep failed");
                }
            }
        }
    }
}

pub async fn run_lifecycle_daemon<S, A, G>(
    lifecycle: Arc<JobLifecycleManager<S, A, G>>,
    cancellation: CancellationToken,
) where
    S: CacheStore,
    A: ArchiveFetcher,
    G: Regenerator,
{
    if let Err(err) = lifecycle.retrieval().resume_pending().await {
        error!(error = %err, "could not resume pending retrievals");
    }
    let interval = lifecycle.config().lifecycle_sweep_interval;
    run_periodic("lifecycle", interval, cancellation, || {
        let lifecycle = Arc::clone(&lifecycle);
        async move { lifecycle.poll_and_advance().await.map(|_| ()) }
    })
    .await;
}

pub fn run_expiry_daemon<S: CacheStore>(
    notifier: Arc<ExpiryNotifier<S>>,
    config: &StagingConfig,
    cancellation: CancellationToken,
) -> impl Future<Output = ()> + use<S> {
    let interval = config.expiry_sweep_interval;
    let window = config.expiry_warning;
    run_periodic("expiry", interval, cancellation, move || {
        let notifier = Arc::clone(&notifier);
        async move { notifier.notify_expiring(window).map(|_| ()) }
    })
}

pub fn run_reclaim_daemon<S: CacheStore>(
    cache: Arc<CacheManager<S>>,
    config: &StagingConfig,
    cancellation: CancellationToken,
) -> impl Future<Output = ()> + use<S> {
    let interval = config.reclaim_sweep_interval;
    let headroom_kb = config.reclaim_headroom_kb;
    run_periodic("reclaim", interval, cancellation, move || {
        let cache = Arc::clone(&cache);
        async move { cache.reclaim_space(headroom_kb).await.map(|_| ()) }
    })
}
