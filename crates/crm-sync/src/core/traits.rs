//! Connector traits for source and target systems.
//!
//! - [`SourceConnector`]: fetches one raw page from a source API
//! - [`TargetConnector`]: finds, creates, updates and links target entities
//!
//! Vendor endpoint shapes live entirely behind these traits; the reader,
//! coordinator and linker only see the types in [`crate::core`].

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::auth::AccessToken;
use crate::error::Result;

use super::cursor::PageRequest;
use super::record::{AssociationEdge, TargetRecord};

/// One raw page as returned by a source connector.
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    /// Raw items, in source order.
    pub items: Vec<Value>,
    /// Continuation token for token-paginated sources.
    pub next_token: Option<String>,
}

/// A per-item failure reported by a batch endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemError {
    /// Position of the failed input, when the target reports it.
    pub index: Option<usize>,
    /// Natural key or id of the failed input, when known.
    pub key: Option<String>,
    pub message: String,
}

/// Result of a non-atomic batch call: successes and failures are independent.
#[derive(Debug, Clone)]
pub struct BatchResponse<T> {
    pub results: Vec<T>,
    pub errors: Vec<BatchItemError>,
}

impl<T> Default for BatchResponse<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Read raw pages from a source system.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Fetch a single page using the given bearer token.
    ///
    /// Implementations map HTTP 401/403 to [`crate::SyncError::Auth`] so the
    /// reader can refresh the token and retry.
    async fn fetch_page(&self, request: &PageRequest, token: &AccessToken) -> Result<RawPage>;

    /// Connector name for log lines.
    fn name(&self) -> &str;
}

/// Write entities and relationships to a target system.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Find the first record whose `property` equals `value`.
    ///
    /// A miss is `Ok(None)`, not an error.
    async fn find(
        &self,
        object_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<TargetRecord>>;

    /// Create a record.
    async fn create(&self, object_type: &str, properties: &Map<String, Value>)
        -> Result<TargetRecord>;

    /// Update an existing record by id.
    async fn update(
        &self,
        object_type: &str,
        id: &str,
        properties: &Map<String, Value>,
    ) -> Result<TargetRecord>;

    /// Create several records in one call. Not atomic.
    async fn batch_create(
        &self,
        object_type: &str,
        records: &[Map<String, Value>],
    ) -> Result<BatchResponse<TargetRecord>>;

    /// Create a single association edge.
    async fn create_association(&self, edge: &AssociationEdge) -> Result<()>;

    /// Create several association edges sharing one `(from_type, to_type)` pair.
    async fn batch_create_associations(
        &self,
        edges: &[AssociationEdge],
    ) -> Result<BatchResponse<AssociationEdge>>;

    /// Connector name for log lines.
    fn name(&self) -> &str;
}
