//! Per-key coalescing delta queue.
//!
//! Keys are serviced oldest first; every pending change of a key lives in one
//! chain, so a burst of notifications for one object costs one queue slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge};
use mirra_core::{key_func, same_version, Delta, DeltaChain, DeltaKind, KeyFunc, MirrorError, ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::cache::KnownObjects;

pub struct DeltaFifoOptions<T> {
    pub key_fn: KeyFunc<T>,
    /// Current contents of the downstream store; enables resync and deletion
    /// detection on `replace`.
    pub known_objects: Option<Arc<dyn KnownObjects<T>>>,
    /// Objects of a fresh listing that differ from the store arrive as
    /// `Replaced` rather than `Sync`.
    pub emit_replaced: bool,
}

impl<T: Resource> DeltaFifoOptions<T> {
    pub fn new(known_objects: Option<Arc<dyn KnownObjects<T>>>) -> Self {
        Self { key_fn: key_func(), known_objects, emit_replaced: true }
    }
}

struct State<T> {
    order: VecDeque<ObjectKey>,
    chains: FxHashMap<ObjectKey, Vec<Delta<T>>>,
    closed: bool,
    /// Set by the first `replace` or enqueue.
    populated: bool,
    /// Keys queued by the first `replace` that have not been fully handed out.
    initial_population: usize,
    /// Key and newest delta of the chain `pop_process` is applying right now.
    in_flight: Option<(ObjectKey, Delta<T>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    DuplicateDelete,
    UnknownDelete,
    NoopUpdate,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            DropReason::DuplicateDelete => "duplicate_delete",
            DropReason::UnknownDelete => "unknown_delete",
            DropReason::NoopUpdate => "noop_update",
        }
    }
}

pub struct DeltaFifo<T> {
    state: Mutex<State<T>>,
    /// Held while a popped chain is applied, and by `resync`/`replace` while they
    /// diff against the store. Lock order: `processing` then `state`.
    processing: Mutex<()>,
    notify: Notify,
    key_fn: KeyFunc<T>,
    known_objects: Option<Arc<dyn KnownObjects<T>>>,
    emit_replaced: bool,
}

impl<T: Resource> DeltaFifo<T> {
    pub fn new(opts: DeltaFifoOptions<T>) -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                chains: FxHashMap::default(),
                closed: false,
                populated: false,
                initial_population: 0,
                in_flight: None,
            }),
            processing: Mutex::new(()),
            notify: Notify::new(),
            key_fn: opts.key_fn,
            known_objects: opts.known_objects,
            emit_replaced: opts.emit_replaced,
        }
    }

    // Only key functions and reads of the known-objects store run under the
    // state lock, so a poisoned guard still guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_processing(&self) -> MutexGuard<'_, ()> {
        self.processing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key_of(&self, obj: &T) -> Result<ObjectKey, MirrorError> {
        Ok((self.key_fn)(obj)?)
    }

    fn known(&self, key: &str) -> Option<Arc<T>> {
        self.known_objects.as_ref().and_then(|k| k.get_by_key(key))
    }

    fn is_known(&self, key: &str) -> bool {
        self.known_objects.as_ref().is_some_and(|k| k.contains_key(key))
    }

    /// Queue one delta for its key.
    pub fn enqueue(&self, delta: Delta<T>) -> Result<(), MirrorError> {
        let key = self.key_of(&delta.object)?;
        let mut st = self.lock();
        if st.closed {
            return Err(MirrorError::QueueClosed);
        }
        st.populated = true;
        self.queue_locked(&mut st, key, delta);
        Ok(())
    }

    pub fn add(&self, obj: impl Into<Arc<T>>) -> Result<(), MirrorError> {
        self.enqueue(Delta { kind: DeltaKind::Added, object: obj.into() })
    }

    pub fn update(&self, obj: impl Into<Arc<T>>) -> Result<(), MirrorError> {
        self.enqueue(Delta { kind: DeltaKind::Updated, object: obj.into() })
    }

    pub fn delete(&self, obj: impl Into<Arc<T>>) -> Result<(), MirrorError> {
        self.enqueue(Delta { kind: DeltaKind::Deleted, object: obj.into() })
    }

    fn drop_reason(&self, st: &State<T>, key: &str, delta: &Delta<T>) -> Option<DropReason> {
        let in_flight = st.in_flight.as_ref().filter(|(k, _)| k == key).map(|(_, d)| d);
        let last = st.chains.get(key).and_then(|chain| chain.last()).or(in_flight);
        match delta.kind {
            DeltaKind::Deleted => match last {
                Some(last) if last.kind == DeltaKind::Deleted => Some(DropReason::DuplicateDelete),
                Some(_) => None,
                None if !self.is_known(key) => Some(DropReason::UnknownDelete),
                None => None,
            },
            DeltaKind::Updated => {
                let prev = match last {
                    Some(last) if last.kind == DeltaKind::Deleted => None,
                    Some(last) => Some(Arc::clone(&last.object)),
                    None => self.known(key),
                };
                prev.filter(|p| same_version(p.as_ref(), delta.object.as_ref())).map(|_| DropReason::NoopUpdate)
            }
            _ => None,
        }
    }

    /// Returns false when the delta was absorbed by an existing entry.
    fn queue_locked(&self, st: &mut State<T>, key: ObjectKey, delta: Delta<T>) -> bool {
        if let Some(reason) = self.drop_reason(st, &key, &delta) {
            trace!(key = %key, kind = delta.kind.as_str(), reason = reason.as_str(), "delta dropped");
            counter!("mirra_deltas_dropped_total", 1u64, "reason" => reason.as_str());
            return false;
        }
        counter!("mirra_deltas_enqueued_total", 1u64, "kind" => delta.kind.as_str());
        match st.chains.get_mut(&key) {
            Some(chain) => chain.push(delta),
            None => {
                st.chains.insert(key.clone(), vec![delta]);
                st.order.push_back(key);
                gauge!("mirra_queue_keys", st.order.len() as f64);
            }
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the oldest pending key and take its whole chain. `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<DeltaChain<T>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if let Some(chain) = Self::pop_locked(&mut st) {
                    st.initial_population = st.initial_population.saturating_sub(1);
                    return Some(chain);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Like `pop`, but `process` runs before `resync` or `replace` may look at
    /// the store again, so neither diffs against a half-applied chain. The state
    /// lock is released while `process` runs: it may enqueue or query this
    /// queue, but must not call `resync` or `replace`.
    pub async fn pop_process<R>(&self, process: impl FnOnce(DeltaChain<T>) -> R) -> Option<R> {
        loop {
            let notified = self.notify.notified();
            {
                let _processing = self.lock_processing();
                let popped = {
                    let mut st = self.lock();
                    match Self::pop_locked(&mut st) {
                        Some(chain) => {
                            st.in_flight = chain.newest().map(|d| (chain.key.clone(), d.clone()));
                            Some(chain)
                        }
                        None if st.closed => return None,
                        None => None,
                    }
                };
                if let Some(chain) = popped {
                    let out = process(chain);
                    let mut st = self.lock();
                    st.in_flight = None;
                    st.initial_population = st.initial_population.saturating_sub(1);
                    return Some(out);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking `pop`.
    pub fn try_pop(&self) -> Option<DeltaChain<T>> {
        let mut st = self.lock();
        let chain = Self::pop_locked(&mut st)?;
        st.initial_population = st.initial_population.saturating_sub(1);
        Some(chain)
    }

    fn pop_locked(st: &mut State<T>) -> Option<DeltaChain<T>> {
        while let Some(key) = st.order.pop_front() {
            if let Some(deltas) = st.chains.remove(&key) {
                gauge!("mirra_queue_keys", st.order.len() as f64);
                return Some(DeltaChain { key, deltas });
            }
        }
        None
    }

    /// Queue `Sync` from the store's own copy for every stored key with no
    /// pending chain.
    pub fn resync(&self) -> Result<(), MirrorError> {
        let Some(known) = self.known_objects.as_ref() else { return Ok(()) };
        let _processing = self.lock_processing();
        let keys = known.list_keys();
        let mut st = self.lock();
        if st.closed {
            return Err(MirrorError::QueueClosed);
        }
        let mut queued = 0usize;
        for key in keys {
            if st.chains.contains_key(&key) {
                continue;
            }
            if let Some(obj) = known.get_by_key(&key) {
                if self.queue_locked(&mut st, key, Delta { kind: DeltaKind::Sync, object: obj }) {
                    queued += 1;
                }
            }
        }
        debug!(queued, "resync queued store objects");
        Ok(())
    }

    /// Diff a fresh full listing against the store: unchanged objects come back
    /// as `Sync`, changed or new ones as `Replaced`, and every key the listing no
    /// longer contains gets one `Deleted` with its last known state.
    pub fn replace(&self, list: Vec<Arc<T>>, resource_version: &str) -> Result<(), MirrorError> {
        let keyed = list
            .into_iter()
            .map(|obj| self.key_of(&obj).map(|key| (key, obj)))
            .collect::<Result<Vec<_>, _>>()?;

        let _processing = self.lock_processing();
        let mut st = self.lock();
        if st.closed {
            return Err(MirrorError::QueueClosed);
        }

        let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
        let (mut synced, mut replaced, mut deleted) = (0usize, 0usize, 0usize);
        for (key, obj) in keyed {
            let unchanged = !self.emit_replaced || self.known(&key).is_some_and(|old| same_version(old.as_ref(), obj.as_ref()));
            let kind = if unchanged { DeltaKind::Sync } else { DeltaKind::Replaced };
            match kind {
                DeltaKind::Sync => synced += 1,
                _ => replaced += 1,
            }
            listed.insert(key.clone());
            self.queue_locked(&mut st, key, Delta { kind, object: obj });
        }

        if let Some(known) = self.known_objects.as_ref() {
            for key in known.list_keys() {
                if listed.contains(&key) {
                    continue;
                }
                let Some(last) = known.get_by_key(&key) else { continue };
                if self.queue_locked(&mut st, key, Delta { kind: DeltaKind::Deleted, object: last }) {
                    deleted += 1;
                }
            }
        }

        // pending keys the store has never seen and the source no longer lists
        let vanished: Vec<(ObjectKey, Arc<T>)> = st
            .order
            .iter()
            .filter(|k| !listed.contains(*k) && !self.is_known(k))
            .filter_map(|k| st.chains.get(k).and_then(|c| c.last()).map(|d| (k.clone(), Arc::clone(&d.object))))
            .collect();
        for (key, last) in vanished {
            if self.queue_locked(&mut st, key, Delta { kind: DeltaKind::Deleted, object: last }) {
                deleted += 1;
            }
        }

        if !st.populated {
            st.populated = true;
            st.initial_population = st.order.len();
        }
        debug!(resource_version, synced, replaced, deleted, "listing replaced");
        Ok(())
    }

    /// True once the first listing has been handed out entirely.
    pub fn has_synced(&self) -> bool {
        let st = self.lock();
        st.populated && st.initial_population == 0
    }

    /// Reject further enqueues and wake the consumer; pending chains stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of keys with pending work.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending keys in service order.
    pub fn list_keys(&self) -> Vec<ObjectKey> {
        self.lock().order.iter().cloned().collect()
    }

    /// Copy of the pending chain for `key`.
    pub fn get_by_key(&self, key: &str) -> Option<Vec<Delta<T>>> {
        self.lock().chains.get(key).cloned()
    }
}
