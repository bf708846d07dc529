//! Drives the delta queue from a change source: list, watch, periodic relist.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::counter;
use mirra_core::{ListerWatcher, MirrorConfig, MirrorError, Resource, WatchEvent};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fifo::DeltaFifo;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
/// A stream the source closes sooner than this counts as a failure, not an expiry.
const MIN_WATCH_LIFETIME: Duration = Duration::from_millis(250);

enum WatchEnd {
    Cancelled,
    /// The source closed the stream; resume from the newest marker.
    Expired,
}

pub struct Reflector<T, L: ?Sized> {
    lw: Arc<L>,
    queue: Arc<DeltaFifo<T>>,
    config: MirrorConfig,
    last_sync_rv: Arc<ArcSwap<String>>,
}

impl<T, L> Reflector<T, L>
where
    T: Resource,
    L: ListerWatcher<T> + ?Sized + 'static,
{
    pub fn new(lw: Arc<L>, queue: Arc<DeltaFifo<T>>, config: MirrorConfig, last_sync_rv: Arc<ArcSwap<String>>) -> Self {
        Self { lw, queue, config, last_sync_rv }
    }

    /// List and watch until cancelled or the queue closes. Expired watches
    /// resume from the newest marker; stream failures restart from a fresh
    /// listing after a capped exponential backoff.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        // one schedule for the whole run, independent of watch sessions
        let mut resync = self.config.resync_period.map(|p| tokio::time::interval_at(Instant::now() + p, p));
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let res = match self.list().await {
                Ok(rv) => {
                    backoff = INITIAL_BACKOFF;
                    self.watch_from(&cancel, &mut resync, rv).await
                }
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => break,
                Err(MirrorError::QueueClosed) => {
                    debug!("delta queue closed; reflector stopping");
                    break;
                }
                Err(e) => {
                    counter!("mirra_watch_restarts_total", 1u64, "kind" => e.kind());
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "list/watch interrupted; relisting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.watch_backoff_max.max(INITIAL_BACKOFF));
                }
            }
        }
        info!("reflector stopped");
    }

    /// Initial listing; seeds the queue and returns the marker to watch from.
    async fn list(&self) -> Result<String, MirrorError> {
        let (items, rv) = self.lw.list().await.map_err(MirrorError::SourceStream)?;
        let count = items.len();
        self.queue.replace(self.keyable(items), &rv)?;
        self.last_sync_rv.store(Arc::new(rv.clone()));
        info!(items = count, resource_version = %rv, "initial listing queued");
        Ok(rv)
    }

    /// Keep a watch open from `rv`, re-opening it whenever the source lets it expire.
    async fn watch_from(
        &self,
        cancel: &CancellationToken,
        resync: &mut Option<Interval>,
        mut rv: String,
    ) -> Result<(), MirrorError> {
        loop {
            let opened = Instant::now();
            match self.watch(cancel, resync, &rv).await? {
                WatchEnd::Cancelled => return Ok(()),
                WatchEnd::Expired if opened.elapsed() < MIN_WATCH_LIFETIME => {
                    return Err(MirrorError::stream("watch stream closed right after opening"));
                }
                WatchEnd::Expired => {
                    rv = self.last_sync_rv.load().as_ref().clone();
                    debug!(resource_version = %rv, "watch expired; resuming");
                }
            }
        }
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
        resync: &mut Option<Interval>,
        rv: &str,
    ) -> Result<WatchEnd, MirrorError> {
        let mut stream = self.lw.watch(rv).await.map_err(MirrorError::SourceStream)?;
        debug!(resource_version = %rv, "watch opened");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(WatchEnd::Cancelled),
                _ = tick(resync) => self.resync().await?,
                ev = stream.next() => match ev {
                    Some(WatchEvent::Added(o)) => self.observe(o, |q, o| q.add(o))?,
                    Some(WatchEvent::Modified(o)) => self.observe(o, |q, o| q.update(o))?,
                    Some(WatchEvent::Deleted(o)) => self.observe(o, |q, o| q.delete(o))?,
                    Some(WatchEvent::Bookmark(rv)) => {
                        debug!(resource_version = %rv, "bookmark");
                        self.last_sync_rv.store(Arc::new(rv));
                    }
                    Some(WatchEvent::Error(msg)) => return Err(MirrorError::stream(msg)),
                    None => return Ok(WatchEnd::Expired),
                },
            }
        }
    }

    fn observe(
        &self,
        obj: T,
        push: impl FnOnce(&DeltaFifo<T>, T) -> Result<(), MirrorError>,
    ) -> Result<(), MirrorError> {
        let rv = obj.resource_version().map(str::to_string);
        match push(&self.queue, obj) {
            Ok(()) => {}
            // the object is dropped; the rest of the stream is still good
            Err(MirrorError::KeyComputation(e)) => {
                counter!("mirra_deltas_dropped_total", 1u64, "reason" => "key");
                warn!(error = %e, "watch event without a usable key dropped");
            }
            Err(e) => return Err(e),
        }
        if let Some(rv) = rv.filter(|rv| !rv.is_empty()) {
            self.last_sync_rv.store(Arc::new(rv));
        }
        Ok(())
    }

    /// Periodic relist-and-diff. A failed listing skips this cycle only.
    async fn resync(&self) -> Result<(), MirrorError> {
        match self.lw.list().await {
            Ok((items, rv)) => {
                let count = items.len();
                self.queue.replace(self.keyable(items), &rv)?;
                self.last_sync_rv.store(Arc::new(rv));
                info!(items = count, "periodic resync queued");
            }
            Err(e) => {
                let e = MirrorError::ResyncDiff(e);
                counter!("mirra_resync_failures_total", 1u64);
                warn!(error = %e, "resync skipped; retrying next period");
            }
        }
        Ok(())
    }

    fn keyable(&self, items: Vec<T>) -> Vec<Arc<T>> {
        items
            .into_iter()
            .filter_map(|o| match self.queue.key_of(&o) {
                Ok(_) => Some(Arc::new(o)),
                Err(e) => {
                    counter!("mirra_deltas_dropped_total", 1u64, "reason" => "key");
                    warn!(error = %e, "listed object without a usable key dropped");
                    None
                }
            })
            .collect()
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
