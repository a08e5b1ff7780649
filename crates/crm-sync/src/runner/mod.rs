//! Migration runner: drives pages through transform, upsert and linking.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::associate::{AssociationLinker, AssociationRegistry, AssociationRequest};
use crate::config::{AssociationRule, Config, JobConfig, PaginationMode, WriteMode};
use crate::connectors::{create_source, create_target};
use crate::core::{Page, SourceRecord, TransformedRecord};
use crate::error::{Result, SyncError};
use crate::schedule::{BatchOptions, BatchScheduler};
use crate::source::SourceReader;
use crate::transform::{transform, MappingTable};
use crate::upsert::UpsertCoordinator;

/// State of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    FetchingPage,
    TransformingBatch,
    PersistingBatch,
    Completed,
    Failed,
}

impl RunState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Idle, FetchingPage) => true,
            (FetchingPage, Completed | TransformingBatch) => true,
            (TransformingBatch, PersistingBatch) => true,
            (PersistingBatch, FetchingPage | Completed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::FetchingPage => "fetching_page",
            RunState::TransformingBatch => "transforming_batch",
            RunState::PersistingBatch => "persisting_batch",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate item counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStats {
    /// Records upserted (created, updated or already present).
    pub migrated: u64,

    /// Records that failed transformation, upsert or linking.
    pub failed: u64,

    /// Records whose association endpoint could not be found, plus records
    /// a lookup-only job found no existing entity for.
    pub not_found: u64,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Job name from the configuration.
    pub job: String,

    /// Final state.
    pub state: RunState,

    /// Whether writes went to an in-memory target.
    pub dry_run: bool,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run ended.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Non-empty pages processed.
    pub pages: u32,

    pub stats: MigrationStats,

    /// The error that ended the run, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Run-level settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub name: String,
    pub write_mode: WriteMode,
    pub batch_size: usize,
    pub pagination_mode: PaginationMode,
    pub max_pages: Option<u32>,
    pub page_delay: Duration,
    pub association: Option<AssociationRule>,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            name: "sync".to_string(),
            write_mode: WriteMode::Single,
            batch_size: 100,
            pagination_mode: PaginationMode::Full,
            max_pages: None,
            page_delay: Duration::from_millis(100),
            association: None,
            dry_run: false,
        }
    }
}

impl RunOptions {
    pub fn from_job(job: &JobConfig) -> Self {
        Self {
            name: job.name.clone(),
            write_mode: job.write_mode,
            batch_size: job.batch_size,
            pagination_mode: job.pagination_mode,
            max_pages: job.max_pages,
            page_delay: job.page_delay(),
            association: job.association.clone(),
            dry_run: false,
        }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_pagination_mode(mut self, mode: PaginationMode) -> Self {
        self.pagination_mode = mode;
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_association(mut self, rule: AssociationRule) -> Self {
        self.association = Some(rule);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A page record that survived transformation.
struct Prepared {
    source_id: String,
    record: TransformedRecord,
}

/// Per-item outcome of the persist phase.
enum ItemOutcome {
    Migrated { not_found: bool },
    /// Lookup-only mode found no existing record.
    Missing,
    Failed(SyncError),
}

/// Migration runner.
pub struct MigrationRunner {
    reader: SourceReader,
    mapping: MappingTable,
    coordinator: UpsertCoordinator,
    linker: AssociationLinker,
    scheduler: BatchScheduler,
    options: RunOptions,
    state: RunState,
}

impl MigrationRunner {
    /// Create a runner from already-built components.
    pub fn new(
        reader: SourceReader,
        mapping: MappingTable,
        coordinator: UpsertCoordinator,
        linker: AssociationLinker,
        scheduler: BatchScheduler,
        options: RunOptions,
    ) -> Self {
        Self {
            reader,
            mapping,
            coordinator,
            linker,
            scheduler,
            options,
            state: RunState::Idle,
        }
    }

    /// Build a runner and its connectors from configuration.
    ///
    /// `dry_run` keeps the real source but writes to an in-memory target.
    pub fn from_config(config: &Config, dry_run: bool) -> Result<Self> {
        let job = &config.job;
        let mapping = MappingTable::load(&job.mapping)?;
        info!(
            "Loaded mapping for {} ({} fields, natural key '{}')",
            mapping.object_type,
            mapping.fields.len(),
            mapping.natural_key
        );

        let (source, tokens) = create_source(&config.source)?;
        let target = create_target(&config.target, dry_run)?;

        let reader = SourceReader::from_config(&config.source, source, tokens);
        let coordinator = UpsertCoordinator::new(target.clone(), job.on_existing)
            .with_key_locks(job.lock_keys())
            .with_retry(job.max_item_retries, config.source.retry_base_delay());
        let registry = AssociationRegistry::from_codes(&config.associations);
        let linker =
            AssociationLinker::new(target, Arc::new(registry)).with_batch_size(job.batch_size);
        let scheduler = BatchScheduler::new(
            BatchOptions::default()
                .with_concurrency(job.concurrency)
                .with_inter_item_delay(job.inter_item_delay()),
        );

        Ok(Self::new(
            reader,
            mapping,
            coordinator,
            linker,
            scheduler,
            RunOptions::from_job(job).with_dry_run(dry_run),
        ))
    }

    /// Override the pagination mode (CLI `--single-page`).
    pub fn with_pagination_mode(mut self, mode: PaginationMode) -> Self {
        self.options.pagination_mode = mode;
        self
    }

    /// Override the page cap (CLI `--max-pages`).
    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        if max_pages.is_some() {
            self.options.max_pages = max_pages;
        }
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run the migration.
    ///
    /// Returns `Err` only for problems found before the first page is
    /// requested. A run that stops on a fatal error is reported with state
    /// [`RunState::Failed`].
    pub async fn run(mut self) -> Result<MigrationReport> {
        self.mapping.validate()?;
        if let Some(rule) = &self.options.association {
            if !self
                .linker
                .registry()
                .contains(&self.mapping.object_type, &rule.to_type)
            {
                warn!(
                    "No association type registered for {} -> {}; every link will fail",
                    self.mapping.object_type, rule.to_type
                );
            }
        }

        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting run {} for job '{}'{}",
            run_id,
            self.options.name,
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        let mut stats = MigrationStats::default();
        let mut pages: u32 = 0;
        let mut failure: Option<SyncError> = None;
        let mut cursor = self.reader.first_cursor();

        self.transition(RunState::FetchingPage);
        loop {
            let page = match self.reader.fetch(cursor.as_ref()).await {
                Ok(page) => page,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if page.is_empty() {
                self.transition(RunState::Completed);
                break;
            }
            pages += 1;

            self.transition(RunState::TransformingBatch);
            let prepared = self.transform_page(&page, &mut stats);

            self.transition(RunState::PersistingBatch);
            let fatal = self.persist_page(prepared, &mut stats).await;
            self.coordinator.release_idle_locks();
            info!(
                "Page {} done: {} migrated, {} failed, {} not found so far",
                pages, stats.migrated, stats.failed, stats.not_found
            );
            if let Some(e) = fatal {
                failure = Some(e);
                break;
            }

            let Some(next) = page.next else {
                self.transition(RunState::Completed);
                break;
            };
            if self.options.pagination_mode == PaginationMode::SinglePage {
                info!("Single-page mode, stopping after the first page");
                self.transition(RunState::Completed);
                break;
            }
            if self.options.max_pages.is_some_and(|max| pages >= max) {
                info!("Reached the page limit of {}", pages);
                self.transition(RunState::Completed);
                break;
            }

            if !self.options.page_delay.is_zero() {
                tokio::time::sleep(self.options.page_delay).await;
            }
            self.transition(RunState::FetchingPage);
            cursor = Some(next);
        }

        if let Some(e) = &failure {
            error!("Run {} failed in {}: {}", run_id, self.state, e);
            self.transition(RunState::Failed);
        }

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        info!(
            "Run {} {}: {} migrated, {} failed, {} not found across {} pages in {:.1}s",
            run_id,
            self.state,
            stats.migrated,
            stats.failed,
            stats.not_found,
            pages,
            duration_seconds
        );

        Ok(MigrationReport {
            run_id,
            job: self.options.name.clone(),
            state: self.state,
            dry_run: self.options.dry_run,
            started_at,
            completed_at,
            duration_seconds,
            pages,
            stats,
            error: failure.map(|e| e.to_string()),
        })
    }

    fn transition(&mut self, next: RunState) {
        if self.state.can_transition_to(next) {
            debug!("State {} -> {}", self.state, next);
        } else {
            warn!("Unexpected state transition {} -> {}", self.state, next);
        }
        self.state = next;
    }

    /// Transform every record of a page. Failures are counted and dropped.
    fn transform_page(&self, page: &Page, stats: &mut MigrationStats) -> Vec<Prepared> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut prepared = Vec::with_capacity(page.records.len());
        for source in &page.records {
            match self.prepare(source, &mut seen) {
                Ok(item) => prepared.push(item),
                Err(e) => {
                    stats.failed += 1;
                    warn!("Skipping record {}: {}", source.display_id(), e);
                }
            }
        }
        debug!(
            "Transformed {} of {} records",
            prepared.len(),
            page.records.len()
        );
        prepared
    }

    fn prepare<'p>(&self, source: &'p SourceRecord, seen: &mut HashSet<&'p str>) -> Result<Prepared> {
        let source_id = source.id.as_deref().ok_or_else(|| {
            SyncError::Validation("record has no source identifier".to_string())
        })?;
        if !seen.insert(source_id) {
            return Err(SyncError::Validation(format!(
                "duplicate source identifier {} within the page",
                source_id
            )));
        }
        Ok(Prepared {
            source_id: source_id.to_string(),
            record: transform(source, &self.mapping)?,
        })
    }

    /// Persist a page, folding item errors into `stats`.
    ///
    /// Returns the first fatal item error, if any.
    async fn persist_page(
        &self,
        prepared: Vec<Prepared>,
        stats: &mut MigrationStats,
    ) -> Option<SyncError> {
        let outcomes = match self.options.write_mode {
            WriteMode::Single => self.persist_single(prepared).await,
            WriteMode::Batch => self.persist_batched(prepared).await,
            WriteMode::LookupOnly => self.persist_lookup_only(prepared).await,
        };

        let mut fatal = None;
        for (source_id, outcome) in outcomes {
            match outcome {
                ItemOutcome::Migrated { not_found } => {
                    stats.migrated += 1;
                    if not_found {
                        stats.not_found += 1;
                    }
                }
                ItemOutcome::Missing => stats.not_found += 1,
                ItemOutcome::Failed(e) => {
                    stats.failed += 1;
                    error!("Record {} failed: {}", source_id, e);
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        fatal
    }

    async fn persist_single(&self, prepared: Vec<Prepared>) -> Vec<(String, ItemOutcome)> {
        let ids: Vec<String> = prepared.iter().map(|p| p.source_id.clone()).collect();
        let object_type = self.mapping.object_type.as_str();
        let natural_key = self.mapping.natural_key.as_str();

        let results = self
            .scheduler
            .run_batch(prepared, |item| async move {
                let outcome = self
                    .coordinator
                    .upsert(object_type, natural_key, &item.record)
                    .await?;
                self.associate(&item.record, &outcome.record().id).await
            })
            .await;

        ids.into_iter()
            .zip(results)
            .map(|(id, result)| {
                let outcome = match result {
                    Ok(not_found) => ItemOutcome::Migrated { not_found },
                    Err(e) => ItemOutcome::Failed(e),
                };
                (id, outcome)
            })
            .collect()
    }

    /// Resolve and link the configured association for one record.
    ///
    /// Returns `true` when the other endpoint does not exist.
    async fn associate(&self, record: &TransformedRecord, from_id: &str) -> Result<bool> {
        let Some(rule) = &self.options.association else {
            return Ok(false);
        };
        let Some(to_id) = self.resolve_endpoint(rule, record).await? else {
            return Ok(true);
        };
        self.linker
            .link(&self.mapping.object_type, from_id, &rule.to_type, &to_id)
            .await?;
        Ok(false)
    }

    async fn resolve_endpoint(
        &self,
        rule: &AssociationRule,
        record: &TransformedRecord,
    ) -> Result<Option<String>> {
        let Some(value) = record.key_value(&rule.from_field) else {
            warn!(
                "Record has no '{}' value, no {} to link",
                rule.from_field, rule.to_type
            );
            return Ok(None);
        };
        let found = self
            .linker
            .resolve(&rule.to_type, &rule.lookup_property, &value)
            .await?;
        if found.is_none() {
            warn!(
                "No {} with {}={} to link",
                rule.to_type, rule.lookup_property, value
            );
        }
        Ok(found)
    }

    async fn persist_batched(&self, prepared: Vec<Prepared>) -> Vec<(String, ItemOutcome)> {
        let records: Vec<TransformedRecord> = prepared.iter().map(|p| p.record.clone()).collect();
        let written = self
            .coordinator
            .upsert_batch(
                &self.mapping.object_type,
                &self.mapping.natural_key,
                &records,
                &self.scheduler,
                self.options.batch_size,
            )
            .await
            .into_iter()
            .map(|result| result.map(|outcome| Some(outcome.record().id.clone())))
            .collect();
        self.link_page(&prepared, written).await
    }

    /// Find existing records without writing them, then link the hits.
    async fn persist_lookup_only(&self, prepared: Vec<Prepared>) -> Vec<(String, ItemOutcome)> {
        let object_type = self.mapping.object_type.as_str();
        let natural_key = self.mapping.natural_key.as_str();
        let found = self
            .scheduler
            .run_batch(prepared.iter().collect(), |item| async move {
                let found = self
                    .coordinator
                    .lookup(object_type, natural_key, &item.record)
                    .await?;
                if found.is_none() {
                    info!("No {} found for source record {}", object_type, item.source_id);
                }
                Ok::<_, SyncError>(found.map(|record| record.id))
            })
            .await;
        self.link_page(&prepared, found).await
    }

    /// Turn per-item write results into outcomes and link the written
    /// records in batches. `Ok(None)` marks a record that does not exist.
    async fn link_page(
        &self,
        prepared: &[Prepared],
        written: Vec<Result<Option<String>>>,
    ) -> Vec<(String, ItemOutcome)> {
        let mut outcomes: Vec<(String, ItemOutcome)> = Vec::with_capacity(prepared.len());
        let mut linkable: Vec<(usize, &TransformedRecord, String)> = Vec::new();
        for (i, (item, result)) in prepared.iter().zip(written).enumerate() {
            let outcome = match result {
                Ok(Some(id)) => {
                    linkable.push((i, &item.record, id));
                    ItemOutcome::Migrated { not_found: false }
                }
                Ok(None) => ItemOutcome::Missing,
                Err(e) => ItemOutcome::Failed(e),
            };
            outcomes.push((item.source_id.clone(), outcome));
        }

        let Some(rule) = &self.options.association else {
            return outcomes;
        };

        // Resolve the other endpoints, then link them in batches.
        let resolved = self
            .scheduler
            .run_batch(linkable, |(i, record, from_id)| async move {
                let to_id = self.resolve_endpoint(rule, record).await;
                Ok((i, from_id, to_id))
            })
            .await;

        let mut requests = Vec::new();
        let mut request_slots: Vec<(usize, String, String)> = Vec::new();
        for (i, from_id, to_id) in resolved.into_iter().flatten() {
            match to_id {
                Ok(None) => outcomes[i].1 = ItemOutcome::Migrated { not_found: true },
                Ok(Some(to_id)) => {
                    requests.push(AssociationRequest::new(
                        self.mapping.object_type.clone(),
                        from_id.clone(),
                        rule.to_type.clone(),
                        to_id.clone(),
                    ));
                    request_slots.push((i, from_id, to_id));
                }
                Err(e) => outcomes[i].1 = ItemOutcome::Failed(e),
            }
        }

        if requests.is_empty() {
            return outcomes;
        }
        let linked = self.linker.link_batch(requests).await;
        // Records sharing a target id share the edge, so a failure marks all of them.
        for failure in linked.errors {
            for (i, from_id, to_id) in &request_slots {
                if *from_id == failure.request.from_id && *to_id == failure.request.to_id {
                    outcomes[*i].1 = ItemOutcome::Failed(failure.error.for_batch_item());
                }
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticTokenSource, TokenProvider};
    use crate::connectors::memory::{InMemorySource, InMemoryTarget};
    use crate::core::PaginationStyle;
    use crate::upsert::UpsertPolicy;
    use serde_json::{json, Map, Value};

    const MAPPING: &str = r#"
object_type: campaigns
natural_key: hs_name
display_name_field: hs_name
fields:
  name: { target: hs_name }
  program: { target: program }
"#;

    fn items(names: &[&str]) -> Vec<Value> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| json!({"id": i + 1, "name": name, "program": "Spring"}))
            .collect()
    }

    struct Fixture {
        source: Arc<InMemorySource>,
        target: Arc<InMemoryTarget>,
        runner: MigrationRunner,
    }

    fn fixture(source: InMemorySource, page_size: u32, options: RunOptions) -> Fixture {
        fixture_on(Arc::new(InMemoryTarget::new()), source, page_size, options)
    }

    fn fixture_on(
        target: Arc<InMemoryTarget>,
        source: InMemorySource,
        page_size: u32,
        options: RunOptions,
    ) -> Fixture {
        let source = Arc::new(source);
        let tokens = Arc::new(TokenProvider::new(Arc::new(StaticTokenSource::new("t"))));
        let reader = SourceReader::new(source.clone(), tokens, PaginationStyle::Offset, page_size)
            .with_retry(0, Duration::ZERO);
        let coordinator = UpsertCoordinator::new(target.clone(), UpsertPolicy::SkipExisting)
            .with_retry(0, Duration::ZERO);
        let mut registry = AssociationRegistry::new();
        registry.register("campaigns", "lists", 7);
        let linker = AssociationLinker::new(target.clone(), Arc::new(registry));
        let scheduler =
            BatchScheduler::new(BatchOptions::default().with_inter_item_delay(Duration::ZERO));
        let mapping = MappingTable::from_yaml(MAPPING).unwrap();
        let runner = MigrationRunner::new(
            reader,
            mapping,
            coordinator,
            linker,
            scheduler,
            options.with_page_delay(Duration::ZERO),
        );
        Fixture {
            source,
            target,
            runner,
        }
    }

    fn list_named(target: &InMemoryTarget, name: &str) -> String {
        let mut properties = Map::new();
        properties.insert("name".into(), json!(name));
        target.insert("lists", properties).id
    }

    fn link_rule() -> AssociationRule {
        AssociationRule {
            to_type: "lists".into(),
            from_field: "program".into(),
            lookup_property: "name".into(),
        }
    }

    #[test]
    fn test_state_transitions() {
        use RunState::*;
        assert!(Idle.can_transition_to(FetchingPage));
        assert!(FetchingPage.can_transition_to(TransformingBatch));
        assert!(FetchingPage.can_transition_to(Completed));
        assert!(TransformingBatch.can_transition_to(PersistingBatch));
        assert!(PersistingBatch.can_transition_to(FetchingPage));
        assert!(PersistingBatch.can_transition_to(Completed));
        assert!(TransformingBatch.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(PersistingBatch));
        assert!(!TransformingBatch.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(FetchingPage));
        assert!(!Failed.can_transition_to(Failed));
        assert!(Completed.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_empty_page() {
        let f = fixture(
            InMemorySource::new(items(&["A", "B", "C", "D"])),
            2,
            RunOptions::default(),
        );

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.pages, 2);
        assert_eq!(
            report.stats,
            MigrationStats {
                migrated: 4,
                failed: 0,
                not_found: 0
            }
        );
        assert_eq!(f.source.fetch_count(), 3);
        assert_eq!(f.target.records("campaigns").len(), 4);
        assert!(report.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_failure_does_not_abort_page_or_run() {
        let f = fixture(
            InMemorySource::new(items(&["A", "B", "C", "D"])),
            3,
            RunOptions::default(),
        );
        f.target.reject_value("B");

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.pages, 2);
        assert_eq!(report.stats.migrated, 3);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(f.source.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_creates_nothing_new() {
        let first = fixture(
            InMemorySource::new(items(&["A", "B"])),
            10,
            RunOptions::default(),
        );
        let target = first.target.clone();
        first.runner.run().await.unwrap();

        let second = fixture_on(
            target.clone(),
            InMemorySource::new(items(&["A", "B"])),
            10,
            RunOptions::default(),
        );
        let report = second.runner.run().await.unwrap();

        assert_eq!(report.stats.migrated, 2);
        assert_eq!(target.create_count(), 2);
        assert_eq!(target.records("campaigns").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_auth_rejection_fails_run() {
        let f = fixture(
            InMemorySource::new(items(&["A"])).unauthorized(),
            10,
            RunOptions::default(),
        );

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.pages, 0);
        assert!(report.error.is_some());
        assert!(!report.is_success());
        assert!(f.target.records("campaigns").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_page_mode_stops_after_first_page() {
        let f = fixture(
            InMemorySource::new(items(&["A", "B", "C", "D"])),
            2,
            RunOptions::default().with_pagination_mode(PaginationMode::SinglePage),
        );

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.pages, 1);
        assert_eq!(report.stats.migrated, 2);
        assert_eq!(f.source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_pages_caps_run() {
        let f = fixture(
            InMemorySource::new(items(&["A", "B", "C", "D", "E"])),
            2,
            RunOptions::default().with_max_pages(Some(2)),
        );

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(report.stats.migrated, 4);
        assert_eq!(f.source.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_missing_source_ids_fail_items() {
        let f = fixture(
            InMemorySource::new(vec![
                json!({"id": 1, "name": "A"}),
                json!({"id": 1, "name": "A again"}),
                json!({"name": "no id"}),
                json!({"id": 2, "name": "B"}),
            ]),
            10,
            RunOptions::default(),
        );

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.stats.migrated, 2);
        assert_eq!(report.stats.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_association_counts_not_found() {
        let f = fixture(
            InMemorySource::new(vec![
                json!({"id": 1, "name": "A", "program": "Spring"}),
                json!({"id": 2, "name": "B", "program": "Autumn"}),
            ]),
            10,
            RunOptions::default().with_association(link_rule()),
        );
        let list = list_named(&f.target, "Spring");

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.stats.migrated, 2);
        assert_eq!(report.stats.not_found, 1);
        let edges = f.target.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to_id, list);
        assert_eq!(edges[0].association_type_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_mode_creates_and_links_in_batches() {
        let f = fixture(
            InMemorySource::new(items(&["A", "B", "C"])),
            10,
            RunOptions {
                batch_size: 2,
                ..RunOptions::default()
            }
            .with_write_mode(WriteMode::Batch)
            .with_association(link_rule()),
        );
        list_named(&f.target, "Spring");

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stats.migrated, 3);
        assert_eq!(report.stats.not_found, 0);
        assert_eq!(f.target.batch_create_calls(), 2);
        assert_eq!(f.target.association_batch_calls(), 1);
        assert_eq!(f.target.edges().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_mode_rejected_links_fail_every_item_and_run() {
        let f = fixture(
            InMemorySource::new(items(&["A", "A", "B"])),
            10,
            RunOptions::default()
                .with_write_mode(WriteMode::Batch)
                .with_association(link_rule()),
        );
        list_named(&f.target, "Spring");
        f.target.deny_associations();

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.pages, 1);
        // Both records keyed "A" share one entity and one edge.
        assert_eq!(report.stats.failed, 3);
        assert_eq!(report.stats.migrated, 0);
        assert!(report.error.unwrap().contains("Authentication rejected"));
        assert!(f.target.edges().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_only_links_existing_records_without_creating() {
        let target = Arc::new(InMemoryTarget::new());
        for name in ["A", "C"] {
            let mut properties = Map::new();
            properties.insert("hs_name".into(), json!(name));
            target.insert("campaigns", properties);
        }
        let list = list_named(&target, "Spring");
        let f = fixture_on(
            target.clone(),
            InMemorySource::new(items(&["A", "B", "C"])),
            10,
            RunOptions::default()
                .with_write_mode(WriteMode::LookupOnly)
                .with_association(link_rule()),
        );

        let report = f.runner.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(
            report.stats,
            MigrationStats {
                migrated: 2,
                failed: 0,
                not_found: 1
            }
        );
        assert_eq!(target.create_count(), 0);
        assert_eq!(target.batch_create_calls(), 0);
        assert_eq!(target.records("campaigns").len(), 2);
        let edges = target.edges();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.to_id == list));
        assert_eq!(target.association_batch_calls(), 1);
    }

    #[test]
    fn test_report_json() {
        let now = Utc::now();
        let report = MigrationReport {
            run_id: "r1".into(),
            job: "campaigns".into(),
            state: RunState::Completed,
            dry_run: true,
            started_at: now,
            completed_at: now,
            duration_seconds: 0.5,
            pages: 2,
            stats: MigrationStats {
                migrated: 4,
                failed: 0,
                not_found: 1,
            },
            error: None,
        };

        let parsed: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(parsed["state"], "completed");
        assert_eq!(parsed["stats"]["migrated"], 4);
        assert!(parsed.get("error").is_none());
    }
}
