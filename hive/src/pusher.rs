//! Drains the push queue of the local store into push sync.
//!
//! Every chunk uploaded locally is queued for push sync. The [`Pusher`]
//! pushes each one to its neighbourhood, marks it synced once a receipt
//! arrives and rewinds the queue after [`PushSyncConfig::retry_interval`]
//! when pushes failed.

use std::{
    collections::HashSet,
    num::NonZeroU32,
    sync::{Arc, Mutex},
};

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use hive_base::{Address, Chunk, storage::ModeSet};
use hive_store::LocalStore;
use n0_future::task::{AbortOnDropHandle, JoinSet};
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::{config::PushSyncConfig, pushsync::PushSync};

/// Pushes locally uploaded chunks to the network until shut down.
#[derive(Debug)]
pub struct Pusher {
    cancel: CancellationToken,
    task: Mutex<Option<AbortOnDropHandle<()>>>,
}

impl Pusher {
    /// Starts pushing the chunks queued in `store`.
    pub fn spawn(store: LocalStore, pushsync: PushSync, config: PushSyncConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            run(store, pushsync, config, cancel.clone()).instrument(info_span!("pusher")),
        );
        Self {
            cancel,
            task: Mutex::new(Some(AbortOnDropHandle::new(task))),
        }
    }

    /// Stops pushing and waits for the pushes in flight to end.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().expect("poisoned").take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("pusher task failed: {err}");
            }
        }
    }
}

fn rate_limiter(config: &PushSyncConfig) -> DefaultKeyedRateLimiter<Address> {
    let rate = NonZeroU32::new(config.rate_per_peer).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
    RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst))
}

async fn run(store: LocalStore, pushsync: PushSync, config: PushSyncConfig, cancel: CancellationToken) {
    let inflight = Arc::new(Mutex::new(HashSet::<Address>::new()));
    let mut subscription = {
        let inflight = inflight.clone();
        store.subscribe_push(move |address| inflight.lock().expect("poisoned").contains(address))
    };
    let limiter = Arc::new(rate_limiter(&config));
    let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let mut tasks = JoinSet::<(Address, bool)>::new();
    let mut retry_at: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(res) = tasks.join_next() => {
                let (address, delivered) = match res {
                    Ok(res) => res,
                    Err(err) => {
                        warn!("push task failed: {err}");
                        continue;
                    }
                };
                inflight.lock().expect("poisoned").remove(&address);
                if !delivered && retry_at.is_none() {
                    retry_at = Some(Instant::now() + config.retry_interval);
                }
            }
            _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                debug!("retrying failed pushes");
                retry_at = None;
                subscription.reset();
            }
            chunk = subscription.recv() => {
                let Some(chunk) = chunk else {
                    debug!("push subscription ended");
                    break;
                };
                let address = *chunk.address();
                if !inflight.lock().expect("poisoned").insert(address) {
                    continue;
                }
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = permits.clone().acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    break;
                };
                let store = store.clone();
                let pushsync = pushsync.clone();
                let limiter = limiter.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let delivered = push(&store, &pushsync, &limiter, chunk).await;
                    (address, delivered)
                });
            }
        }
    }
    subscription.stop();
    tasks.shutdown().await;
}

/// Pushes one chunk, returning whether it reached its neighbourhood.
async fn push(store: &LocalStore, pushsync: &PushSync, limiter: &DefaultKeyedRateLimiter<Address>, chunk: Chunk) -> bool {
    let address = *chunk.address();
    if let Ok(peer) = pushsync.closest_peer(&address) {
        limiter.until_key_ready(&peer).await;
    }
    match pushsync.push_chunk_to_closest(chunk).await {
        Ok(_) => trace!(chunk = %address.fmt_short(), "receipt received"),
        Err(err) if err.is_want_self() => {
            trace!(chunk = %address.fmt_short(), "we are the closest node")
        }
        Err(err) => {
            debug!(chunk = %address.fmt_short(), "push failed: {err}");
            return false;
        }
    }
    if let Err(err) = store.set(ModeSet::Sync, vec![address]).await {
        warn!(chunk = %address.fmt_short(), "marking chunk synced failed: {err}");
        return false;
    }
    true
}
