//! Pull and push subscriptions.
//!
//! Both read the indexes in batches and then wait on a watch channel that
//! every committing write touching the index signals.

use std::{ops::Bound, sync::Arc};

use hive_base::{Address, Chunk, MAX_PO};
use n0_future::task::AbortOnDropHandle;
use redb::ReadableTable;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace};

use super::Inner;
use crate::{
    error::LocalStoreError,
    tables::{PULL_TABLE, PUSH_TABLE},
};

const PULL_BATCH: usize = 128;
const PUSH_BATCH: usize = 128;
const SUBSCRIPTION_BUFFER: usize = 64;

pub(super) fn subscribe_pull(
    inner: Arc<Inner>,
    bin: u8,
    since: u64,
    until: Option<u64>,
) -> mpsc::Receiver<(Address, u64)> {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let bin = bin.min(MAX_PO);
    tokio::spawn(
        async move {
            if let Err(err) = pull_loop(inner, bin, since, until, tx).await {
                debug!("pull subscription failed: {err:#}");
            }
        }
        .instrument(debug_span!("subscribe_pull", bin)),
    );
    rx
}

async fn pull_loop(
    inner: Arc<Inner>,
    bin: u8,
    mut since: u64,
    until: Option<u64>,
    tx: mpsc::Sender<(Address, u64)>,
) -> Result<(), LocalStoreError> {
    let last = until.unwrap_or(u64::MAX);
    let mut trigger = inner.triggers.pull[bin as usize].subscribe();
    let cancel = inner.cancel.clone();
    while since <= last {
        trigger.borrow_and_update();
        let batch = inner.pull_range(bin, since, last)?;
        for (address, bin_id) in &batch {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = tx.send((*address, *bin_id)) => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
            }
            since = bin_id + 1;
        }
        if batch.len() == PULL_BATCH {
            continue;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tx.closed() => return Ok(()),
            res = trigger.changed() => {
                if res.is_err() {
                    return Ok(());
                }
            }
        }
    }
    trace!("pull subscription reached its end");
    Ok(())
}

/// A subscription to chunks queued for push sync.
///
/// Dropping it ends the subscription.
#[derive(Debug)]
pub struct PushSubscription {
    rx: mpsc::Receiver<Chunk>,
    reset: Arc<Notify>,
    stop: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl PushSubscription {
    /// Receives the next chunk, `None` once the subscription ended.
    pub async fn recv(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Rewinds to the oldest chunk still queued.
    ///
    /// Chunks already buffered are delivered again after them.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    /// Ends the subscription.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

pub(super) fn subscribe_push<F>(inner: Arc<Inner>, skip: F) -> PushSubscription
where
    F: Fn(&Address) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let reset = Arc::new(Notify::new());
    let stop = inner.cancel.child_token();
    let task = tokio::spawn(
        {
            let reset = reset.clone();
            let stop = stop.clone();
            async move {
                if let Err(err) = push_loop(inner, skip, tx, reset, stop).await {
                    debug!("push subscription failed: {err:#}");
                }
            }
        }
        .instrument(debug_span!("subscribe_push")),
    );
    PushSubscription {
        rx,
        reset,
        stop,
        _task: AbortOnDropHandle::new(task),
    }
}

async fn push_loop<F>(
    inner: Arc<Inner>,
    skip: F,
    tx: mpsc::Sender<Chunk>,
    reset: Arc<Notify>,
    stop: CancellationToken,
) -> Result<(), LocalStoreError>
where
    F: Fn(&Address) -> bool,
{
    let mut trigger = inner.triggers.push.subscribe();
    let mut cursor: Option<(u64, Address)> = None;
    'outer: loop {
        trigger.borrow_and_update();
        let batch = inner.push_range(cursor, PUSH_BATCH)?;
        for (ts, address) in &batch {
            cursor = Some((*ts, *address));
            if skip(address) {
                continue;
            }
            let chunk = match inner.read_chunk(address) {
                Ok(chunk) => chunk,
                // synced or removed in the meantime
                Err(LocalStoreError::Storage { source, .. }) if source.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                _ = reset.notified() => {
                    cursor = None;
                    continue 'outer;
                }
                res = tx.send(chunk) => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        if batch.len() == PUSH_BATCH {
            continue;
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            _ = tx.closed() => return Ok(()),
            _ = reset.notified() => cursor = None,
            res = trigger.changed() => {
                if res.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

impl Inner {
    fn pull_range(
        &self,
        bin: u8,
        from: u64,
        to: u64,
    ) -> Result<Vec<(Address, u64)>, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PULL_TABLE)?;
        let mut out = Vec::new();
        for entry in table.range((bin, from)..=(bin, to))?.take(PULL_BATCH) {
            let (key, value) = entry?;
            out.push((Address::new(*value.value()), key.value().1));
        }
        Ok(out)
    }

    fn push_range(
        &self,
        after: Option<(u64, Address)>,
        limit: usize,
    ) -> Result<Vec<(u64, Address)>, LocalStoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PUSH_TABLE)?;
        let mut out = Vec::new();
        let range = match &after {
            Some((ts, address)) => table.range((
                Bound::Excluded((*ts, address.as_bytes())),
                Bound::Unbounded,
            ))?,
            None => table.iter()?,
        };
        for entry in range.take(limit) {
            let (key, _) = entry?;
            let (ts, address) = key.value();
            out.push((ts, Address::new(*address)));
        }
        Ok(out)
    }
}
