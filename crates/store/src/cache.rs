//! Keyed cache: `ThreadSafeStore` plus the key function of the mirrored type.

use std::sync::Arc;

use mirra_core::{key_func, Indexers, KeyFunc, MirrorError, ObjectKey, Resource};

use crate::index::ThreadSafeStore;

/// Read-only view of the keys the mirror currently holds. The delta queue uses
/// it to synthesize `Sync` and `Deleted` deltas during resync.
pub trait KnownObjects<T>: Send + Sync {
    fn list_keys(&self) -> Vec<ObjectKey>;
    fn get_by_key(&self, key: &str) -> Option<Arc<T>>;
    fn contains_key(&self, key: &str) -> bool {
        self.get_by_key(key).is_some()
    }
}

pub struct Cache<T> {
    store: ThreadSafeStore<T>,
    key_fn: KeyFunc<T>,
}

impl<T: Resource> Cache<T> {
    pub fn new(key_fn: KeyFunc<T>, indexers: Indexers<T>) -> Self {
        Self { store: ThreadSafeStore::new(indexers), key_fn }
    }

    /// Cache keyed by `<namespace>/<name>`.
    pub fn with_indexers(indexers: Indexers<T>) -> Self {
        Self::new(key_func(), indexers)
    }

    pub fn key_of(&self, obj: &T) -> Result<ObjectKey, MirrorError> {
        Ok((self.key_fn)(obj)?)
    }

    pub fn add(&self, obj: Arc<T>) -> Result<(), MirrorError> {
        let key = self.key_of(&obj)?;
        self.store.add(key, obj)?;
        Ok(())
    }

    pub fn update(&self, obj: Arc<T>) -> Result<(), MirrorError> {
        let key = self.key_of(&obj)?;
        self.store.update(key, obj)?;
        Ok(())
    }

    pub fn delete(&self, obj: &T) -> Result<(), MirrorError> {
        let key = self.key_of(obj)?;
        self.store.delete(&key)?;
        Ok(())
    }

    /// Stored copy of the object with the same key as `obj`.
    pub fn get(&self, obj: &T) -> Result<Option<Arc<T>>, MirrorError> {
        let key = self.key_of(obj)?;
        Ok(self.store.get(&key))
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.store.get(key)
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.store.list()
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        self.store.list_keys()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Re-initialize from a full listing. Every key is computed first, so a
    /// key failure leaves the previous content in place.
    pub fn replace(&self, list: impl IntoIterator<Item = Arc<T>>, resource_version: &str) -> Result<(), MirrorError> {
        let keyed = list
            .into_iter()
            .map(|obj| self.key_of(&obj).map(|key| (key, obj)))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.replace(keyed, resource_version)?;
        Ok(())
    }

    pub fn resource_version(&self) -> String {
        self.store.resource_version()
    }

    pub fn index(&self, index_name: &str, obj: &T) -> Result<Vec<Arc<T>>, MirrorError> {
        Ok(self.store.index(index_name, obj)?)
    }

    pub fn index_keys(&self, index_name: &str, value: &str) -> Result<Vec<ObjectKey>, MirrorError> {
        Ok(self.store.index_keys(index_name, value)?)
    }

    pub fn by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<T>>, MirrorError> {
        Ok(self.store.by_index(index_name, value)?)
    }

    pub fn list_index_func_values(&self, index_name: &str) -> Vec<String> {
        self.store.list_index_func_values(index_name)
    }

    pub fn get_indexers(&self) -> Indexers<T> {
        self.store.get_indexers()
    }

    pub fn add_indexers(&self, indexers: Indexers<T>) -> Result<(), MirrorError> {
        Ok(self.store.add_indexers(indexers)?)
    }

    pub fn store(&self) -> &ThreadSafeStore<T> {
        &self.store
    }
}

impl<T: Resource> KnownObjects<T> for Cache<T> {
    fn list_keys(&self) -> Vec<ObjectKey> {
        self.store.list_keys()
    }

    fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.store.get(key)
    }

    fn contains_key(&self, key: &str) -> bool {
        self.store.contains(key)
    }
}
