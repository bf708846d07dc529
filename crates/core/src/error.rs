//! Error taxonomy shared by the store, the delta queue and the reconciliation loop.

/// Boxed error from an external collaborator (change source, index function).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The key function could not place an object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),
    #[error("{0}")]
    Custom(String),
}

/// Store-level failure applying a mutation or answering an index query.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("index {name:?} does not exist")]
    IndexNotFound { name: String },
    #[error("index function {name:?} failed for {key:?}: {source}")]
    IndexFunc {
        name: String,
        key: String,
        #[source]
        source: BoxError,
    },
    /// The index function rejected the object passed to an `index` query.
    #[error("index function {name:?} failed for the query object: {source}")]
    QueryIndexFunc {
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("indexer {name:?} already registered")]
    IndexerConflict { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("computing object key: {0}")]
    KeyComputation(#[from] KeyError),
    #[error("store mutation failed: {0}")]
    StoreMutation(#[from] StoreError),
    #[error("change stream interrupted: {0}")]
    SourceStream(#[source] BoxError),
    #[error("resync listing failed: {0}")]
    ResyncDiff(#[source] BoxError),
    #[error("delta queue is closed")]
    QueueClosed,
}

impl MirrorError {
    pub fn stream(msg: impl Into<String>) -> Self {
        MirrorError::SourceStream(msg.into().into())
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorError::KeyComputation(_) => "key",
            MirrorError::StoreMutation(_) => "store",
            MirrorError::SourceStream(_) => "stream",
            MirrorError::ResyncDiff(_) => "resync",
            MirrorError::QueueClosed => "closed",
        }
    }
}
