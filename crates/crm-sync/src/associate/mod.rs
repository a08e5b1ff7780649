//! Typed relationships between already-migrated entities.

mod registry;

pub use registry::AssociationRegistry;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::core::{AssociationEdge, TargetConnector};
use crate::error::{ErrorClass, Result, SyncError};

/// Default number of edges per batch call.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Request to link two entities by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRequest {
    pub from_type: String,
    pub from_id: String,
    pub to_type: String,
    pub to_id: String,
}

impl AssociationRequest {
    pub fn new(
        from_type: impl Into<String>,
        from_id: impl Into<String>,
        to_type: impl Into<String>,
        to_id: impl Into<String>,
    ) -> Self {
        Self {
            from_type: from_type.into(),
            from_id: from_id.into(),
            to_type: to_type.into(),
            to_id: to_id.into(),
        }
    }
}

/// A request that could not be linked.
#[derive(Debug)]
pub struct LinkFailure {
    pub request: AssociationRequest,
    /// Keeps the classification of the underlying failure, so a rejected
    /// token stays an `Auth` error.
    pub error: SyncError,
}

/// Outcome of [`AssociationLinker::link_batch`]. Successes and failures are
/// independent; a batch is never all-or-nothing.
///
/// Every request ends up in exactly one of the two lists.
#[derive(Debug, Default)]
pub struct BatchLinkOutcome {
    pub results: Vec<AssociationEdge>,
    pub errors: Vec<LinkFailure>,
}

/// Creates association edges, checking every pair against the registry
/// before anything is sent.
pub struct AssociationLinker {
    target: Arc<dyn TargetConnector>,
    registry: Arc<AssociationRegistry>,
    batch_size: usize,
}

impl AssociationLinker {
    pub fn new(target: Arc<dyn TargetConnector>, registry: Arc<AssociationRegistry>) -> Self {
        Self {
            target,
            registry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn registry(&self) -> &AssociationRegistry {
        &self.registry
    }

    /// Link two entities.
    ///
    /// An unregistered `(from_type, to_type)` pair fails with a configuration
    /// error and nothing reaches the target.
    #[instrument(level = "debug", skip(self))]
    pub async fn link(
        &self,
        from_type: &str,
        from_id: &str,
        to_type: &str,
        to_id: &str,
    ) -> Result<AssociationEdge> {
        let edge = self.registry.edge(from_type, from_id, to_type, to_id)?;
        self.target.create_association(&edge).await?;
        info!(
            outcome = "success",
            "linked {} {} -> {} {} (type {})",
            from_type,
            from_id,
            to_type,
            to_id,
            edge.association_type_id
        );
        Ok(edge)
    }

    /// Link many pairs, grouped by object-type pair and chunked by batch size.
    pub async fn link_batch(&self, requests: Vec<AssociationRequest>) -> BatchLinkOutcome {
        let mut outcome = BatchLinkOutcome::default();
        let mut groups: BTreeMap<(String, String), Vec<(AssociationEdge, AssociationRequest)>> =
            BTreeMap::new();

        for request in requests {
            match self.registry.edge(
                &request.from_type,
                &request.from_id,
                &request.to_type,
                &request.to_id,
            ) {
                Ok(edge) => groups
                    .entry((request.from_type.clone(), request.to_type.clone()))
                    .or_default()
                    .push((edge, request)),
                Err(error) => outcome.errors.push(LinkFailure { request, error }),
            }
        }

        for ((from_type, to_type), members) in groups {
            for chunk in members.chunks(self.batch_size) {
                let edges: Vec<AssociationEdge> = chunk.iter().map(|(e, _)| e.clone()).collect();
                match self.target.batch_create_associations(&edges).await {
                    Ok(response) => {
                        let mut failed = vec![false; chunk.len()];
                        let mut unattributed = Vec::new();
                        for error in response.errors {
                            let position = error.index.filter(|i| *i < chunk.len()).or_else(|| {
                                error.key.as_deref().and_then(|key| {
                                    chunk.iter().position(|(e, _)| e.from_id == key)
                                })
                            });
                            match position {
                                Some(i) if !failed[i] => {
                                    failed[i] = true;
                                    outcome.errors.push(LinkFailure {
                                        request: chunk[i].1.clone(),
                                        error: SyncError::BatchItem(error.message),
                                    });
                                }
                                Some(_) => {}
                                None => {
                                    warn!(
                                        "Unattributable association error for {} -> {}: {}",
                                        from_type, to_type, error.message
                                    );
                                    unattributed.push(error.message);
                                }
                            }
                        }
                        for (i, (edge, request)) in chunk.iter().enumerate() {
                            if failed[i] {
                                continue;
                            }
                            if response.results.contains(edge) {
                                outcome.results.push(edge.clone());
                                continue;
                            }
                            let message = if unattributed.is_empty() {
                                "target reported no result for this edge".to_string()
                            } else {
                                format!(
                                    "target reported no result for this edge ({})",
                                    unattributed.join("; ")
                                )
                            };
                            outcome.errors.push(LinkFailure {
                                request: request.clone(),
                                error: SyncError::BatchItem(message),
                            });
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Association batch {} -> {} ({} edges) failed: {}",
                            from_type,
                            to_type,
                            chunk.len(),
                            e
                        );
                        outcome
                            .errors
                            .extend(chunk.iter().map(|(_, request)| LinkFailure {
                                request: request.clone(),
                                error: e.for_batch_item(),
                            }));
                    }
                }
            }
        }

        info!(
            "Association batch finished: {} linked, {} failed",
            outcome.results.len(),
            outcome.errors.len()
        );
        outcome
    }

    /// Find the id of the entity of `to_type` whose `lookup_property` equals
    /// `lookup_value`. A miss is `Ok(None)`.
    pub async fn resolve(
        &self,
        to_type: &str,
        lookup_property: &str,
        lookup_value: &str,
    ) -> Result<Option<String>> {
        match self.target.find(to_type, lookup_property, lookup_value).await {
            Ok(found) => Ok(found.map(|r| r.id)),
            Err(e) if e.class() == ErrorClass::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::memory::InMemoryTarget;
    use crate::core::{BatchItemError, BatchResponse, TargetRecord};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    /// Confirms only the first edge of every batch and reports one error it
    /// cannot tie to an input.
    struct PartialTarget;

    #[async_trait]
    impl TargetConnector for PartialTarget {
        async fn find(&self, _: &str, _: &str, _: &str) -> Result<Option<TargetRecord>> {
            Ok(None)
        }

        async fn create(&self, _: &str, _: &Map<String, Value>) -> Result<TargetRecord> {
            Err(SyncError::Validation("unsupported".into()))
        }

        async fn update(&self, _: &str, _: &str, _: &Map<String, Value>) -> Result<TargetRecord> {
            Err(SyncError::Validation("unsupported".into()))
        }

        async fn batch_create(
            &self,
            _: &str,
            _: &[Map<String, Value>],
        ) -> Result<BatchResponse<TargetRecord>> {
            Ok(BatchResponse::default())
        }

        async fn create_association(&self, _: &AssociationEdge) -> Result<()> {
            Ok(())
        }

        async fn batch_create_associations(
            &self,
            edges: &[AssociationEdge],
        ) -> Result<BatchResponse<AssociationEdge>> {
            Ok(BatchResponse {
                results: edges.iter().take(1).cloned().collect(),
                errors: vec![BatchItemError {
                    index: None,
                    key: None,
                    message: "internal error".into(),
                }],
            })
        }

        fn name(&self) -> &str {
            "partial"
        }
    }

    fn registry() -> Arc<AssociationRegistry> {
        let mut registry = AssociationRegistry::new();
        registry.register("contacts", "lists", 1);
        registry.register("campaigns", "lists", 7);
        Arc::new(registry)
    }

    fn seeded() -> (Arc<InMemoryTarget>, Vec<String>, String) {
        let target = Arc::new(InMemoryTarget::new());
        let contacts = (0..3)
            .map(|_| target.insert("contacts", Map::new()).id)
            .collect();
        let list = target.insert("lists", Map::new()).id;
        (target, contacts, list)
    }

    #[tokio::test]
    async fn test_unregistered_pair_is_rejected_before_sending() {
        let (target, contacts, list) = seeded();
        let linker = AssociationLinker::new(target.clone(), registry());

        let err = linker
            .link("lists", &list, "contacts", &contacts[0])
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(target.edges().is_empty());
    }

    #[tokio::test]
    async fn test_link_creates_edge() {
        let (target, contacts, list) = seeded();
        let linker = AssociationLinker::new(target.clone(), registry());

        let edge = linker
            .link("contacts", &contacts[0], "lists", &list)
            .await
            .unwrap();

        assert_eq!(edge.association_type_id, 1);
        assert_eq!(target.edges(), vec![edge]);
    }

    #[tokio::test]
    async fn test_batch_with_one_malformed_input() {
        let (target, contacts, list) = seeded();
        let linker = AssociationLinker::new(target.clone(), registry());

        let outcome = linker
            .link_batch(vec![
                AssociationRequest::new("contacts", contacts[0].clone(), "lists", list.clone()),
                AssociationRequest::new("contacts", "", "lists", list.clone()),
                AssociationRequest::new("contacts", contacts[2].clone(), "lists", list.clone()),
            ])
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].request.from_id, "");
        assert_eq!(target.association_batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_reports_target_item_errors_and_chunks() {
        let (target, contacts, list) = seeded();
        let linker = AssociationLinker::new(target.clone(), registry()).with_batch_size(2);

        let outcome = linker
            .link_batch(vec![
                AssociationRequest::new("contacts", contacts[0].clone(), "lists", list.clone()),
                AssociationRequest::new("contacts", "missing", "lists", list.clone()),
                AssociationRequest::new("contacts", contacts[1].clone(), "lists", list.clone()),
                AssociationRequest::new("lists", list.clone(), "contacts", contacts[0].clone()),
            ])
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(target.association_batch_calls(), 2);
    }

    #[tokio::test]
    async fn test_batch_accounts_for_every_request() {
        let linker = AssociationLinker::new(Arc::new(PartialTarget), registry());
        let requests: Vec<AssociationRequest> = ["1", "2", "3"]
            .iter()
            .map(|id| AssociationRequest::new("contacts", *id, "lists", "9"))
            .collect();

        let outcome = linker.link_batch(requests).await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].from_id, "1");
        assert_eq!(outcome.results.len() + outcome.errors.len(), 3);
        let failed: Vec<&str> = outcome
            .errors
            .iter()
            .map(|f| f.request.from_id.as_str())
            .collect();
        assert_eq!(failed, vec!["2", "3"]);
        assert!(outcome.errors[0].error.to_string().contains("internal error"));
    }

    #[tokio::test]
    async fn test_rejected_batch_keeps_auth_class() {
        let (target, contacts, list) = seeded();
        target.deny_associations();
        let linker = AssociationLinker::new(target.clone(), registry());

        let outcome = linker
            .link_batch(vec![
                AssociationRequest::new("contacts", contacts[0].clone(), "lists", list.clone()),
                AssociationRequest::new("contacts", contacts[1].clone(), "lists", list.clone()),
            ])
            .await;

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().all(|f| f.error.class() == ErrorClass::Auth));
        assert!(target.edges().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_by_property() {
        let target = Arc::new(InMemoryTarget::new());
        let mut properties = Map::new();
        properties.insert("name".into(), json!("(Campaign) Spring"));
        let list = target.insert("lists", properties);
        let linker = AssociationLinker::new(target.clone(), registry());

        assert_eq!(
            linker.resolve("lists", "name", "(Campaign) Spring").await.unwrap(),
            Some(list.id)
        );
        assert_eq!(linker.resolve("lists", "name", "Other").await.unwrap(), None);
    }
}
