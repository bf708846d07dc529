//! Reconciliation loop: replay popped delta chains onto the cache and notify
//! the handler after each committed mutation.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use mirra_core::{Delta, DeltaChain, DeltaKind, Indexers, ListerWatcher, MirrorConfig, MirrorError, Resource, ResourceEventHandler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{Cache, KnownObjects};
use crate::fifo::{DeltaFifo, DeltaFifoOptions};
use crate::reflector::Reflector;

/// Apply `deltas` oldest to newest. The first failing mutation aborts the rest
/// of the chain and is returned; callbacks already made stay made.
pub fn process_deltas<T, H>(handler: &H, cache: &Cache<T>, deltas: &[Delta<T>]) -> Result<(), MirrorError>
where
    T: Resource,
    H: ResourceEventHandler<T> + ?Sized,
{
    for d in deltas {
        match d.kind {
            DeltaKind::Sync | DeltaKind::Replaced | DeltaKind::Added | DeltaKind::Updated => {
                match cache.get(&d.object)? {
                    Some(old) => {
                        cache.update(Arc::clone(&d.object))?;
                        handler.on_update(&old, &d.object);
                    }
                    None => {
                        cache.add(Arc::clone(&d.object))?;
                        handler.on_add(&d.object);
                    }
                }
            }
            DeltaKind::Deleted => {
                cache.delete(&d.object)?;
                handler.on_delete(&d.object);
            }
        }
    }
    Ok(())
}

/// Cache, delta queue and change source wired to one handler.
pub struct Controller<T, L: ?Sized, H: ?Sized> {
    config: MirrorConfig,
    cache: Arc<Cache<T>>,
    queue: Arc<DeltaFifo<T>>,
    lw: Arc<L>,
    handler: Arc<H>,
    last_sync_rv: Arc<ArcSwap<String>>,
}

/// Build a cache plus the controller that keeps it in sync with `lw`.
pub fn new_indexer_informer<T, L, H>(
    lw: L,
    resync_period: Option<Duration>,
    handler: H,
    indexers: Indexers<T>,
) -> (Arc<Cache<T>>, Controller<T, L, H>)
where
    T: Resource,
    L: ListerWatcher<T> + 'static,
    H: ResourceEventHandler<T> + 'static,
{
    let cache = Arc::new(Cache::with_indexers(indexers));
    let config = MirrorConfig::default().with_resync_period(resync_period);
    let controller = Controller::new(config, Arc::new(lw), Arc::new(handler), Arc::clone(&cache));
    (cache, controller)
}

impl<T, L, H> Controller<T, L, H>
where
    T: Resource,
    L: ListerWatcher<T> + ?Sized + 'static,
    H: ResourceEventHandler<T> + ?Sized + 'static,
{
    pub fn new(config: MirrorConfig, lw: Arc<L>, handler: Arc<H>, cache: Arc<Cache<T>>) -> Self {
        let known: Arc<dyn KnownObjects<T>> = cache.clone();
        let opts = DeltaFifoOptions { emit_replaced: config.emit_replaced, ..DeltaFifoOptions::new(Some(known)) };
        let queue = Arc::new(DeltaFifo::new(opts));
        Self { config, cache, queue, lw, handler, last_sync_rv: Arc::new(ArcSwap::from_pointee(String::new())) }
    }

    /// Run until `cancel` fires or a chain fails. On cancellation the queue is
    /// closed and everything already queued is still replayed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), MirrorError> {
        info!(resync = ?self.config.resync_period, "controller starting");
        // the guard also stops the tasks when a handler panic unwinds this frame
        let stop = cancel.child_token();
        let _stop_on_exit = stop.clone().drop_guard();
        let reflector = Reflector::new(
            Arc::clone(&self.lw),
            Arc::clone(&self.queue),
            self.config.clone(),
            Arc::clone(&self.last_sync_rv),
        );
        let reflector_task = tokio::spawn({
            let token = stop.clone();
            async move { reflector.run(token).await }
        });
        tokio::spawn({
            let queue = Arc::clone(&self.queue);
            let stop = stop.clone();
            async move {
                stop.cancelled().await;
                queue.close();
            }
        });

        let res = self.process_loop().await;

        stop.cancel();
        self.queue.close();
        if let Err(e) = reflector_task.await {
            error!(error = %e, "reflector task failed");
        }
        info!(ok = res.is_ok(), "controller stopped");
        res
    }

    async fn process_loop(&self) -> Result<(), MirrorError> {
        let process = |chain: DeltaChain<T>| {
            debug!(key = %chain.key, deltas = chain.len(), "processing chain");
            process_deltas(self.handler.as_ref(), &self.cache, &chain.deltas).map_err(|e| {
                counter!("mirra_chain_errors_total", 1u64, "kind" => e.kind());
                error!(key = %chain.key, error = %e, "delta chain aborted");
                e
            })
        };
        while let Some(res) = self.queue.pop_process(process).await {
            res?;
            counter!("mirra_chains_processed_total", 1u64);
            gauge!("mirra_store_items", self.cache.len() as f64);
        }
        debug!("delta queue drained");
        Ok(())
    }

    pub fn cache(&self) -> &Arc<Cache<T>> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<DeltaFifo<T>> {
        &self.queue
    }

    /// True once the initial listing has been replayed into the cache.
    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Newest marker seen from a listing, event or bookmark.
    pub fn last_sync_resource_version(&self) -> String {
        self.last_sync_rv.load().as_ref().clone()
    }
}
