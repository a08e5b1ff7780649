//! In-process connectors for dry runs and tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::auth::AccessToken;
use crate::core::record::value_as_key;
use crate::core::{
    AssociationEdge, BatchItemError, BatchResponse, Cursor, PageRequest, RawPage,
    SourceConnector, TargetConnector, TargetRecord,
};
use crate::error::{Result, SyncError};

/// Serves a fixed list of items with offset or token pagination.
///
/// Tokens are the decimal index of the next item.
pub struct InMemorySource {
    items: Vec<Value>,
    unauthorized: bool,
    fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            unauthorized: false,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Reject every request as unauthorized.
    pub fn unauthorized(mut self) -> Self {
        self.unauthorized = true;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn slice(&self, start: usize, len: usize) -> Vec<Value> {
        self.items.iter().skip(start).take(len).cloned().collect()
    }
}

#[async_trait]
impl SourceConnector for InMemorySource {
    async fn fetch_page(&self, request: &PageRequest, _token: &AccessToken) -> Result<RawPage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized {
            return Err(SyncError::from_status(401, "unauthorized"));
        }
        match &request.cursor {
            Some(Cursor::Offset { offset, limit }) => Ok(RawPage {
                items: self.slice(*offset as usize, *limit as usize),
                next_token: None,
            }),
            Some(Cursor::Token(token)) => {
                let start = token.parse::<usize>().map_err(|_| {
                    SyncError::Rejected {
                        status: 400,
                        message: format!("invalid page token '{}'", token),
                    }
                })?;
                Ok(self.token_page(start, request.page_size as usize))
            }
            None => Ok(self.token_page(0, request.page_size as usize)),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl InMemorySource {
    fn token_page(&self, start: usize, page_size: usize) -> RawPage {
        let items = self.slice(start, page_size);
        let end = start + items.len();
        RawPage {
            items,
            next_token: (end < self.items.len()).then(|| end.to_string()),
        }
    }
}

#[derive(Default)]
struct Store {
    records: BTreeMap<String, Vec<TargetRecord>>,
    edges: Vec<AssociationEdge>,
}

/// Target that keeps everything in memory.
///
/// Counts calls per operation and can inject failures, which makes it the
/// backing store for `--dry-run` as well as for tests.
#[derive(Default)]
pub struct InMemoryTarget {
    store: Mutex<Store>,
    next_id: AtomicU64,
    finds: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    batch_creates: AtomicUsize,
    association_batches: AtomicUsize,
    failing_calls: AtomicUsize,
    associations_denied: AtomicBool,
    calls: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    latency: Option<Duration>,
}

impl InMemoryTarget {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1001),
            ..Self::default()
        }
    }

    /// Sleep this long in every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next_calls(&self, n: usize) {
        self.failing_calls.store(n, Ordering::SeqCst);
    }

    /// Answer every association call with 403.
    pub fn deny_associations(&self) {
        self.associations_denied.store(true, Ordering::SeqCst);
    }

    /// Reject creates whose properties contain `value`.
    pub fn reject_value(&self, value: impl Into<String>) {
        self.lock_rejected().insert(value.into());
    }

    /// Seed an existing record.
    pub fn insert(&self, object_type: &str, properties: Map<String, Value>) -> TargetRecord {
        let record = TargetRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
            object_type: object_type.to_string(),
            properties,
        };
        self.lock_store()
            .records
            .entry(object_type.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    pub fn records(&self, object_type: &str) -> Vec<TargetRecord> {
        self.lock_store()
            .records
            .get(object_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn edges(&self) -> Vec<AssociationEdge> {
        self.lock_store().edges.clone()
    }

    /// Names of the operations called so far, in call order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn batch_create_calls(&self) -> usize {
        self.batch_creates.load(Ordering::SeqCst)
    }

    pub fn association_batch_calls(&self) -> usize {
        self.association_batches.load(Ordering::SeqCst)
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rejected(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.rejected.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, op: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op.to_string());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::TransientNetwork(format!("injected failure in {}", op)));
        }
        Ok(())
    }

    fn check_rejected(&self, properties: &Map<String, Value>) -> Result<()> {
        let rejected = self.lock_rejected();
        let hit = properties
            .values()
            .filter_map(value_as_key)
            .find(|v| rejected.contains(v));
        match hit {
            Some(value) => Err(SyncError::Rejected {
                status: 400,
                message: format!("property value '{}' is not allowed", value),
            }),
            None => Ok(()),
        }
    }

    fn create_record(&self, object_type: &str, properties: &Map<String, Value>) -> Result<TargetRecord> {
        self.check_rejected(properties)?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(object_type, properties.clone()))
    }

    fn check_association_access(&self) -> Result<()> {
        if self.associations_denied.load(Ordering::SeqCst) {
            return Err(SyncError::from_status(403, "missing association scope"));
        }
        Ok(())
    }

    fn exists(store: &Store, object_type: &str, id: &str) -> bool {
        store
            .records
            .get(object_type)
            .map_or(false, |records| records.iter().any(|r| r.id == id))
    }

    fn add_edge(&self, edge: &AssociationEdge) -> Result<()> {
        let mut store = self.lock_store();
        for (object_type, id) in [(&edge.from_type, &edge.from_id), (&edge.to_type, &edge.to_id)] {
            if !Self::exists(&store, object_type, id) {
                return Err(SyncError::NotFound(format!("{} {}", object_type, id)));
            }
        }
        if !store.edges.contains(edge) {
            store.edges.push(edge.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl TargetConnector for InMemoryTarget {
    async fn find(
        &self,
        object_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<TargetRecord>> {
        self.enter("find").await?;
        self.finds.fetch_add(1, Ordering::SeqCst);
        let store = self.lock_store();
        let found = store.records.get(object_type).and_then(|records| {
            records
                .iter()
                .find(|r| {
                    r.properties.get(property).and_then(value_as_key).as_deref() == Some(value)
                })
                .cloned()
        });
        debug!("memory find {} {}={}: {}", object_type, property, value, found.is_some());
        Ok(found)
    }

    async fn create(
        &self,
        object_type: &str,
        properties: &Map<String, Value>,
    ) -> Result<TargetRecord> {
        self.enter("create").await?;
        self.create_record(object_type, properties)
    }

    async fn update(
        &self,
        object_type: &str,
        id: &str,
        properties: &Map<String, Value>,
    ) -> Result<TargetRecord> {
        self.enter("update").await?;
        self.check_rejected(properties)?;
        let mut store = self.lock_store();
        let record = store
            .records
            .get_mut(object_type)
            .and_then(|records| records.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| SyncError::NotFound(format!("{} {}", object_type, id)))?;
        for (k, v) in properties {
            record.properties.insert(k.clone(), v.clone());
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone())
    }

    async fn batch_create(
        &self,
        object_type: &str,
        records: &[Map<String, Value>],
    ) -> Result<BatchResponse<TargetRecord>> {
        self.enter("batch_create").await?;
        self.batch_creates.fetch_add(1, Ordering::SeqCst);
        let mut response = BatchResponse::default();
        for (index, properties) in records.iter().enumerate() {
            match self.create_record(object_type, properties) {
                Ok(record) => response.results.push(record),
                Err(e) => response.errors.push(BatchItemError {
                    index: Some(index),
                    key: None,
                    message: e.to_string(),
                }),
            }
        }
        Ok(response)
    }

    async fn create_association(&self, edge: &AssociationEdge) -> Result<()> {
        self.enter("create_association").await?;
        self.check_association_access()?;
        self.add_edge(edge)
    }

    async fn batch_create_associations(
        &self,
        edges: &[AssociationEdge],
    ) -> Result<BatchResponse<AssociationEdge>> {
        self.enter("batch_create_associations").await?;
        self.association_batches.fetch_add(1, Ordering::SeqCst);
        self.check_association_access()?;
        let mut response = BatchResponse::default();
        for (index, edge) in edges.iter().enumerate() {
            match self.add_edge(edge) {
                Ok(()) => response.results.push(edge.clone()),
                Err(e) => response.errors.push(BatchItemError {
                    index: Some(index),
                    key: Some(edge.from_id.clone()),
                    message: e.to_string(),
                }),
            }
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token() -> AccessToken {
        AccessToken::new("t", 1)
    }

    #[tokio::test]
    async fn test_source_token_pages() {
        let source = InMemorySource::new((0..5).map(|i| json!({"id": i})).collect());
        let request = PageRequest {
            page_size: 2,
            cursor: Some(Cursor::Token("4".into())),
        };
        let page = source.fetch_page(&request, &token()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_token, None);

        let first = PageRequest {
            page_size: 2,
            cursor: None,
        };
        let page = source.fetch_page(&first, &token()).await.unwrap();
        assert_eq!(page.next_token.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_target_find_matches_numeric_property() {
        let target = InMemoryTarget::new();
        let mut properties = Map::new();
        properties.insert("id".into(), json!(1317));
        let seeded = target.insert("contacts", properties);

        let found = target.find("contacts", "id", "1317").await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(seeded.id));
        assert!(target.find("contacts", "id", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_association_requires_both_endpoints() {
        let target = InMemoryTarget::new();
        let contact = target.insert("contacts", Map::new());
        let edge = AssociationEdge {
            from_type: "contacts".into(),
            from_id: contact.id,
            to_type: "lists".into(),
            to_id: "999".into(),
            association_type_id: 1,
        };
        let err = target.create_association(&edge).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(target.edges().is_empty());
    }
}
