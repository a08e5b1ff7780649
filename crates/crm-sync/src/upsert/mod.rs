//! Idempotent writes keyed by a natural key.
//!
//! The coordinator looks a record up by its natural key before deciding to
//! create, update or leave it alone, so re-running a migration over the same
//! source data never creates a second entity for the same key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

pub use crate::config::UpsertPolicy;
use crate::core::record::value_as_key;
use crate::core::{TargetConnector, TargetRecord, TransformedRecord};
use crate::error::{Result, SyncError};
use crate::schedule::{retry_transient, BatchScheduler};

/// What an upsert did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(TargetRecord),
    Updated(TargetRecord),
    /// The key already existed and the policy left it untouched.
    Unchanged(TargetRecord),
}

impl UpsertOutcome {
    pub fn record(&self) -> &TargetRecord {
        match self {
            UpsertOutcome::Created(r) | UpsertOutcome::Updated(r) | UpsertOutcome::Unchanged(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            UpsertOutcome::Created(_) => "created",
            UpsertOutcome::Updated(_) => "updated",
            UpsertOutcome::Unchanged(_) => "unchanged",
        }
    }
}

/// In-process keyed async mutex.
///
/// Serializes lookup-then-create for the same natural key when several items
/// are in flight. It does nothing for writers in other processes.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decides between create, update and no-op for each transformed record.
pub struct UpsertCoordinator {
    target: Arc<dyn TargetConnector>,
    policy: UpsertPolicy,
    locks: Option<KeyLocks>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl UpsertCoordinator {
    pub fn new(target: Arc<dyn TargetConnector>, policy: UpsertPolicy) -> Self {
        Self {
            target,
            policy,
            locks: None,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    /// Serialize upserts per natural key.
    pub fn with_key_locks(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(KeyLocks::new);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn policy(&self) -> UpsertPolicy {
        self.policy
    }

    /// Release lock entries for keys no longer in flight.
    pub fn release_idle_locks(&self) {
        if let Some(locks) = &self.locks {
            locks.prune();
        }
    }

    /// Create, update or skip `record` depending on whether `natural_key`
    /// already exists in the target.
    ///
    /// Transient failures retry the whole lookup-then-write sequence, so a
    /// create that timed out after succeeding is found on the next attempt.
    pub async fn upsert(
        &self,
        object_type: &str,
        natural_key: &str,
        record: &TransformedRecord,
    ) -> Result<UpsertOutcome> {
        let key = key_of(object_type, natural_key, record)?;

        let _guard = match &self.locks {
            Some(locks) => Some(
                locks
                    .lock(&format!("{}/{}/{}", object_type, natural_key, key))
                    .await,
            ),
            None => None,
        };

        let what = format!("upsert {} {}={}", object_type, natural_key, key);
        let properties = record.to_properties();
        let outcome = retry_transient(&what, self.max_retries, self.retry_base_delay, || {
            self.upsert_once(object_type, natural_key, &key, &properties)
        })
        .await?;

        info!(
            outcome = "success",
            "{} {} {}={} (id {})",
            outcome.label(),
            object_type,
            natural_key,
            key,
            outcome.record().id
        );
        Ok(outcome)
    }

    /// Find the existing target record for `record` without writing.
    ///
    /// A miss is `Ok(None)`. Transient failures are retried.
    pub async fn lookup(
        &self,
        object_type: &str,
        natural_key: &str,
        record: &TransformedRecord,
    ) -> Result<Option<TargetRecord>> {
        let key = key_of(object_type, natural_key, record)?;
        let found = self.find(object_type, natural_key, &key).await?;
        match &found {
            Some(existing) => debug!("found {} {}={} (id {})", object_type, natural_key, key, existing.id),
            None => debug!("no {} with {}={}", object_type, natural_key, key),
        }
        Ok(found)
    }

    async fn find(&self, object_type: &str, natural_key: &str, key: &str) -> Result<Option<TargetRecord>> {
        let what = format!("find {} {}={}", object_type, natural_key, key);
        retry_transient(&what, self.max_retries, self.retry_base_delay, || {
            self.target.find(object_type, natural_key, key)
        })
        .await
    }

    async fn upsert_once(
        &self,
        object_type: &str,
        natural_key: &str,
        key: &str,
        properties: &Map<String, Value>,
    ) -> Result<UpsertOutcome> {
        match self.target.find(object_type, natural_key, key).await? {
            Some(existing) => self.apply_policy(object_type, existing, properties).await,
            None => Ok(UpsertOutcome::Created(
                self.target.create(object_type, properties).await?,
            )),
        }
    }

    async fn apply_policy(
        &self,
        object_type: &str,
        existing: TargetRecord,
        properties: &Map<String, Value>,
    ) -> Result<UpsertOutcome> {
        match self.policy {
            UpsertPolicy::Update => Ok(UpsertOutcome::Updated(
                self.target
                    .update(object_type, &existing.id, properties)
                    .await?,
            )),
            UpsertPolicy::SkipExisting => {
                debug!("{} {} already exists, leaving it unchanged", object_type, existing.id);
                Ok(UpsertOutcome::Unchanged(existing))
            }
        }
    }

    /// Upsert a page of records, creating the misses through batch calls.
    ///
    /// Every lookup of the page finishes before the first write starts. Found
    /// records then go through the update policy one by one and the misses
    /// are created in chunks of `batch_size`; within the page, later records
    /// sharing a key reuse the first one's result. Batch creates are not
    /// retried since they are not idempotent.
    pub async fn upsert_batch(
        &self,
        object_type: &str,
        natural_key: &str,
        records: &[TransformedRecord],
        scheduler: &BatchScheduler,
        batch_size: usize,
    ) -> Vec<Result<UpsertOutcome>> {
        let mut results: Vec<Option<Result<UpsertOutcome>>> = Vec::with_capacity(records.len());
        results.resize_with(records.len(), || None);

        // Phase 1: validate keys and look each one up.
        let lookups = scheduler
            .run_batch(records.iter().collect(), |record| async move {
                let key = key_of(object_type, natural_key, record)?;
                let found = self.find(object_type, natural_key, &key).await?;
                Ok::<_, SyncError>((key, record.to_properties(), found))
            })
            .await;

        // Split hits from misses; misses are grouped by key, first occurrence first.
        let mut existing: Vec<(usize, TargetRecord, Map<String, Value>)> = Vec::new();
        let mut pending: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut to_create: Vec<(String, Map<String, Value>)> = Vec::new();
        for (index, lookup) in lookups.into_iter().enumerate() {
            match lookup {
                Err(e) => results[index] = Some(Err(e)),
                Ok((_, properties, Some(found))) => existing.push((index, found, properties)),
                Ok((key, properties, None)) => {
                    let waiting = pending.entry(key.clone()).or_default();
                    if waiting.is_empty() {
                        to_create.push((key, properties));
                    }
                    waiting.push(index);
                }
            }
        }

        // Phase 2: apply the policy to records that already exist.
        let applied = scheduler
            .run_batch(existing, |(index, found, properties)| async move {
                Ok((index, self.apply_policy(object_type, found, &properties).await))
            })
            .await;
        for (index, outcome) in applied.into_iter().flatten() {
            results[index] = Some(outcome);
        }

        // Phase 3: batch-create the misses.
        for chunk in to_create.chunks(batch_size.max(1)) {
            let bodies: Vec<Map<String, Value>> = chunk.iter().map(|(_, p)| p.clone()).collect();
            let mut created: HashMap<String, Result<TargetRecord>> = HashMap::new();
            match self.target.batch_create(object_type, &bodies).await {
                Ok(response) => {
                    for record in response.results {
                        if let Some(key) = record.properties.get(natural_key).and_then(value_as_key)
                        {
                            created.insert(key, Ok(record));
                        }
                    }
                    for error in response.errors {
                        let key = error.key.clone().or_else(|| {
                            error
                                .index
                                .and_then(|i| chunk.get(i))
                                .map(|(k, _)| k.clone())
                        });
                        if let Some(key) = key {
                            created.insert(key, Err(SyncError::BatchItem(error.message)));
                        }
                    }
                }
                Err(e) => {
                    warn!("Batch create of {} {} failed: {}", chunk.len(), object_type, e);
                    for (key, _) in chunk {
                        created.insert(key.clone(), Err(e.for_batch_item()));
                    }
                }
            }

            for (key, _) in chunk {
                let indices = pending.remove(key).unwrap_or_default();
                let result = created.remove(key).unwrap_or_else(|| {
                    Err(SyncError::BatchItem(format!(
                        "batch create returned no result for {}={}",
                        natural_key, key
                    )))
                });
                for (n, index) in indices.into_iter().enumerate() {
                    results[index] = Some(match (&result, n) {
                        (Ok(record), 0) => Ok(UpsertOutcome::Created(record.clone())),
                        (Ok(record), _) => Ok(UpsertOutcome::Unchanged(record.clone())),
                        (Err(e), _) => Err(e.for_batch_item()),
                    });
                }
                if let Ok(record) = &result {
                    info!(
                        outcome = "success",
                        "created {} {}={} (id {})",
                        object_type, natural_key, key, record.id
                    );
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(SyncError::BatchItem("record was not processed".into())))
            })
            .collect()
    }
}

fn key_of(object_type: &str, natural_key: &str, record: &TransformedRecord) -> Result<String> {
    record.key_value(natural_key).ok_or_else(|| {
        SyncError::Validation(format!(
            "{} record has no value for natural key '{}'",
            object_type, natural_key
        ))
    })
}
