//! Collaborators supplied by the host application
//!
//! The engine never touches storage itself: queries go through a
//! [`MatchProvider`] and retrieved or received datasets go to a [`RetrieveSink`].
//! Both are shared by every association and must be safe for concurrent use.

use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use thiserror::Error;

/// Failures reported by a [`MatchProvider`]
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Invalid query identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Information model not supported: {0}")]
    UnsupportedModel(String),

    #[error("Out of resources: {0}")]
    OutOfResources(String),

    #[error("Query failed: {0}")]
    Failed(String),
}

/// Failures reported by a [`RetrieveSink`]
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Dataset rejected: {0}")]
    DatasetMismatch(String),

    #[error("Out of resources: {0}")]
    OutOfResources(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store failed: {0}")]
    Failed(String),
}

/// Source of C-FIND candidates
#[async_trait]
pub trait MatchProvider: Send + Sync {
    /// Begin a query for `identifier` under the information model `abstract_syntax`
    async fn start_query(
        &self,
        abstract_syntax: &str,
        identifier: &InMemDicomObject,
    ) -> std::result::Result<Box<dyn MatchQuery>, ProviderError>;
}

/// A running query producing candidates lazily
#[async_trait]
pub trait MatchQuery: Send {
    /// Next candidate, or `None` once the query is exhausted
    async fn next(&mut self) -> std::result::Result<Option<InMemDicomObject>, ProviderError>;

    /// Stop producing candidates; `next` is not called again afterwards
    async fn cancel(&mut self);
}

/// A dataset handed over for persistence
#[derive(Debug, Clone)]
pub struct RetrievedDataset {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax the dataset should be written in
    pub transfer_syntax: String,
    pub dataset: InMemDicomObject,
}

/// Destination for retrieved datasets.
///
/// Every call either stores the dataset durably or returns an error.
#[async_trait]
pub trait RetrieveSink: Send + Sync {
    async fn store(&self, dataset: RetrievedDataset) -> std::result::Result<(), SinkError>;
}

/// Candidates from a fixed list; handy for hosts with precomputed results
pub struct VecQuery {
    candidates: std::vec::IntoIter<InMemDicomObject>,
    cancelled: bool,
}

impl VecQuery {
    pub fn new(candidates: Vec<InMemDicomObject>) -> Self {
        Self {
            candidates: candidates.into_iter(),
            cancelled: false,
        }
    }
}

#[async_trait]
impl MatchQuery for VecQuery {
    async fn next(&mut self) -> std::result::Result<Option<InMemDicomObject>, ProviderError> {
        if self.cancelled {
            return Ok(None);
        }
        Ok(self.candidates.next())
    }

    async fn cancel(&mut self) {
        self.cancelled = true;
    }
}
