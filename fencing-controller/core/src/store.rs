use crate::{FencingSet, ParseError};

/// A value read from the store, with the version token that must accompany a
/// write of its successor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the fencing declaration was modified concurrently")]
    Conflict,

    /// The stored declaration could not be parsed. The version is reported so
    /// that the declaration can still be replaced outright.
    #[error("invalid fencing declaration: {error}")]
    Malformed {
        version: String,
        #[source]
        error: ParseError,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// The durable, versioned record of which instances should be fenced.
///
/// Writes are compare-and-swap: [`DeclarationStore::set`] fails with
/// [`Error::Conflict`] when the record changed since `version` was read.
/// Setting an empty set removes the record, which reads back as
/// [`FencingSet::none`].
#[async_trait::async_trait]
pub trait DeclarationStore: Send + Sync {
    async fn get(&self) -> Result<Versioned<FencingSet>, Error>;

    async fn set(&self, fencing: &FencingSet, version: &str) -> Result<(), Error>;
}
