//! Mirra core types: resources, keys, deltas and the contracts the engine is built on

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod error;
pub mod handler;
pub mod source;

pub use config::MirrorConfig;
pub use error::{BoxError, KeyError, MirrorError, StoreError};
pub use handler::{HandlerFns, ResourceEventHandler};
pub use source::{ListerWatcher, WatchEvent};

/// Deterministic identity of a resource within one mirrored collection.
pub type ObjectKey = String;

/// A mirrored record. Identity fields feed the key function, the version marker
/// feeds the no-op detection in the delta queue.
pub trait Resource: Clone + Send + Sync + 'static {
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> Option<&str>;
    /// Opaque version marker assigned by the remote source (e.g. resourceVersion).
    fn resource_version(&self) -> Option<&str>;
}

/// Pure `Resource -> Key` function supplied at construction.
pub type KeyFunc<T> = Arc<dyn Fn(&T) -> Result<ObjectKey, KeyError> + Send + Sync>;

/// `<namespace>/<name>` for namespaced objects, `<name>` otherwise.
pub fn meta_namespace_key<T: Resource>(obj: &T) -> Result<ObjectKey, KeyError> {
    let name = obj.name().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)?;
    match obj.namespace().filter(|ns| !ns.is_empty()) {
        Some(ns) => Ok(format!("{}/{}", ns, name)),
        None => Ok(name.to_string()),
    }
}

/// Default key function (`meta_namespace_key`) as a shareable value.
pub fn key_func<T: Resource>() -> KeyFunc<T> {
    Arc::new(meta_namespace_key::<T>)
}

/// Inverse of `meta_namespace_key`.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(KeyError::InvalidKey(key.to_string())),
    }
}

/// Equality policy used to detect no-op changes: both objects carry a non-empty
/// version marker and the markers match. Unversioned objects never compare equal.
pub fn same_version<T: Resource>(a: &T, b: &T) -> bool {
    match (a.resource_version(), b.resource_version()) {
        (Some(x), Some(y)) => !x.is_empty() && x == y,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Object seen in a fresh listing with a different version than the store holds.
    Replaced,
    /// Re-delivery of an object the store already holds.
    Sync,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Replaced => "replaced",
            DeltaKind::Sync => "sync",
        }
    }
}

/// One observed change to a single resource.
#[derive(Debug, Clone)]
pub struct Delta<T> {
    pub kind: DeltaKind,
    pub object: Arc<T>,
}

impl<T> Delta<T> {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<T>>) -> Self {
        Self { kind, object: object.into() }
    }
}

/// Pending deltas of one key, oldest first.
#[derive(Debug, Clone)]
pub struct DeltaChain<T> {
    pub key: ObjectKey,
    pub deltas: Vec<Delta<T>>,
}

impl<T> DeltaChain<T> {
    pub fn oldest(&self) -> Option<&Delta<T>> { self.deltas.first() }
    pub fn newest(&self) -> Option<&Delta<T>> { self.deltas.last() }
    pub fn kinds(&self) -> Vec<DeltaKind> { self.deltas.iter().map(|d| d.kind).collect() }
    pub fn len(&self) -> usize { self.deltas.len() }
    pub fn is_empty(&self) -> bool { self.deltas.is_empty() }
}

/// Values an object is filed under in one index.
pub type IndexValues = SmallVec<[String; 2]>;

/// `Resource -> set of index values`. Evaluated before any store mutation.
pub type IndexFunc<T> = Arc<dyn Fn(&T) -> Result<IndexValues, BoxError> + Send + Sync>;

/// Index name -> index function.
pub type Indexers<T> = HashMap<String, IndexFunc<T>>;

pub const NAMESPACE_INDEX: &str = "namespace";

/// Files namespaced objects under their namespace; cluster-scoped objects are not indexed.
pub fn namespace_index_func<T: Resource>() -> IndexFunc<T> {
    Arc::new(|obj: &T| {
        let mut out = IndexValues::new();
        if let Some(ns) = obj.namespace().filter(|ns| !ns.is_empty()) {
            out.push(ns.to_string());
        }
        Ok(out)
    })
}

pub mod prelude {
    pub use super::{
        Delta, DeltaChain, DeltaKind, HandlerFns, IndexFunc, IndexValues, Indexers, KeyFunc, ListerWatcher,
        MirrorConfig, MirrorError, ObjectKey, Resource, ResourceEventHandler, WatchEvent,
    };
}
