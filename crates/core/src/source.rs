//! Change source contract: an initial listing plus a live stream of changes.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::BoxError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker; carries the resource version only.
    Bookmark(String),
    /// Stream-level failure reported by the source.
    Error(String),
}

/// Supplies `list()` and `watch(marker)`. Transport, auth and wire formats live
/// behind this trait.
#[async_trait]
pub trait ListerWatcher<T: Send + 'static>: Send + Sync {
    /// Full listing of the collection and the marker it is consistent with.
    async fn list(&self) -> Result<(Vec<T>, String), BoxError>;

    /// Changes after `resource_version`. Stream end means the watch expired.
    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, WatchEvent<T>>, BoxError>;
}
