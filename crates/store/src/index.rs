//! Thread-safe keyed map with secondary indices.
//!
//! One `RwLock` covers the primary map and every index, so readers never see
//! an object whose index entries are stale. Index values are evaluated before
//! anything is mutated; a failing index function rejects the whole write.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mirra_core::{IndexValues, Indexers, ObjectKey, StoreError};
use rustc_hash::{FxHashMap, FxHashSet};

/// index value -> keys filed under it
type Index = FxHashMap<String, FxHashSet<ObjectKey>>;

/// Per-indexer values computed for one object.
type Filed = Vec<(String, IndexValues)>;

struct Inner<T> {
    items: FxHashMap<ObjectKey, Arc<T>>,
    indexers: Indexers<T>,
    indices: FxHashMap<String, Index>,
    resource_version: String,
}

impl<T> Inner<T> {
    fn filed(&self, key: &str, obj: &T) -> Result<Filed, StoreError> {
        self.indexers
            .iter()
            .map(|(name, f)| {
                f(obj)
                    .map(|vals| (name.clone(), vals))
                    .map_err(|source| StoreError::IndexFunc { name: name.clone(), key: key.to_string(), source })
            })
            .collect()
    }

    fn file(&mut self, key: &str, filed: Filed) {
        for (name, vals) in filed {
            let index = self.indices.entry(name).or_default();
            for v in vals {
                index.entry(v).or_default().insert(key.to_string());
            }
        }
    }

    fn unfile(&mut self, key: &str, filed: &Filed) {
        for (name, vals) in filed {
            let Some(index) = self.indices.get_mut(name) else { continue };
            for v in vals.iter() {
                if let Some(keys) = index.get_mut(v.as_str()) {
                    keys.remove(key);
                    // no empty sets left behind
                    if keys.is_empty() {
                        index.remove(v.as_str());
                    }
                }
            }
        }
    }

    fn objects<'a>(&self, keys: impl IntoIterator<Item = &'a ObjectKey>) -> Vec<Arc<T>> {
        keys.into_iter().filter_map(|k| self.items.get(k).cloned()).collect()
    }
}

pub struct ThreadSafeStore<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> ThreadSafeStore<T> {
    pub fn new(indexers: Indexers<T>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: FxHashMap::default(),
                indexers,
                indices: FxHashMap::default(),
                resource_version: String::new(),
            }),
        }
    }

    // Writers only mutate after every fallible step has succeeded, so a guard
    // poisoned by a panicking index function still protects consistent data.
    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace. Last writer wins by call order.
    pub fn add(&self, key: ObjectKey, obj: Arc<T>) -> Result<(), StoreError> {
        let mut inner = self.write();
        let filed = inner.filed(&key, &obj)?;
        let stale = match inner.items.get(&key) {
            Some(old) => Some(inner.filed(&key, old)?),
            None => None,
        };
        if let Some(stale) = stale {
            inner.unfile(&key, &stale);
        }
        inner.file(&key, filed);
        inner.items.insert(key, obj);
        Ok(())
    }

    pub fn update(&self, key: ObjectKey, obj: Arc<T>) -> Result<(), StoreError> {
        self.add(key, obj)
    }

    /// Remove the entry and its index references; absent keys are a no-op.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.write();
        let Some(old) = inner.items.get(key).cloned() else { return Ok(()) };
        let stale = inner.filed(key, &old)?;
        inner.unfile(key, &stale);
        inner.items.remove(key);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.read().items.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().items.contains_key(key)
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.read().items.values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        self.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap the whole content for `items`; previous entries are discarded, not diffed.
    pub fn replace(
        &self,
        items: impl IntoIterator<Item = (ObjectKey, Arc<T>)>,
        resource_version: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.write();
        // a later duplicate key shadows the earlier object and its index values
        let mut next: FxHashMap<ObjectKey, (Arc<T>, Filed)> = FxHashMap::default();
        for (key, obj) in items {
            let filed = inner.filed(&key, &obj)?;
            next.insert(key, (obj, filed));
        }
        inner.indices.clear();
        inner.items = FxHashMap::default();
        for (key, (obj, filed)) in next {
            inner.file(&key, filed);
            inner.items.insert(key, obj);
        }
        inner.resource_version = resource_version.to_string();
        Ok(())
    }

    /// Marker passed to the last `replace`.
    pub fn resource_version(&self) -> String {
        self.read().resource_version.clone()
    }

    /// Objects sharing any index value with `obj` under `index_name`.
    pub fn index(&self, index_name: &str, obj: &T) -> Result<Vec<Arc<T>>, StoreError> {
        let inner = self.read();
        let f = inner
            .indexers
            .get(index_name)
            .ok_or_else(|| StoreError::IndexNotFound { name: index_name.to_string() })?;
        let values =
            f(obj).map_err(|source| StoreError::QueryIndexFunc { name: index_name.to_string(), source })?;
        let Some(index) = inner.indices.get(index_name) else { return Ok(Vec::new()) };
        let mut keys: FxHashSet<&ObjectKey> = FxHashSet::default();
        for v in values.iter() {
            if let Some(set) = index.get(v.as_str()) {
                keys.extend(set.iter());
            }
        }
        Ok(inner.objects(keys))
    }

    /// Keys filed under `value` in `index_name`.
    pub fn index_keys(&self, index_name: &str, value: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let inner = self.read();
        if !inner.indexers.contains_key(index_name) {
            return Err(StoreError::IndexNotFound { name: index_name.to_string() });
        }
        Ok(inner
            .indices
            .get(index_name)
            .and_then(|index| index.get(value))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<T>>, StoreError> {
        let inner = self.read();
        if !inner.indexers.contains_key(index_name) {
            return Err(StoreError::IndexNotFound { name: index_name.to_string() });
        }
        Ok(match inner.indices.get(index_name).and_then(|index| index.get(value)) {
            Some(set) => inner.objects(set.iter()),
            None => Vec::new(),
        })
    }

    /// Every value currently produced by the index function of `index_name`.
    pub fn list_index_func_values(&self, index_name: &str) -> Vec<String> {
        self.read().indices.get(index_name).map(|index| index.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn get_indexers(&self) -> Indexers<T> {
        self.read().indexers.clone()
    }

    /// Register more indexers; existing objects are filed under them right away.
    pub fn add_indexers(&self, new_indexers: Indexers<T>) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(name) = new_indexers.keys().find(|n| inner.indexers.contains_key(*n)) {
            return Err(StoreError::IndexerConflict { name: name.clone() });
        }
        let mut filed: HashMap<String, Filed> = HashMap::new();
        for (name, f) in new_indexers.iter() {
            for (key, obj) in inner.items.iter() {
                let vals = f(obj).map_err(|source| StoreError::IndexFunc {
                    name: name.clone(),
                    key: key.clone(),
                    source,
                })?;
                filed.entry(key.clone()).or_default().push((name.clone(), vals));
            }
        }
        inner.indexers.extend(new_indexers);
        for (key, f) in filed {
            inner.file(&key, f);
        }
        Ok(())
    }
}
