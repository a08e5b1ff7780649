//! # crm-sync
//!
//! Paginated record synchronization from a REST source into a CRM target.
//!
//! A run reads the source page by page and maps every record onto the target
//! schema through a declarative mapping table. Each record is then upserted by
//! natural key, so re-running a job never duplicates entities. Optionally each
//! migrated record is linked to an existing entity of another type.
//!
//! - **Offset and token pagination** with token refresh on 401
//! - **Idempotent upserts** with skip or update policies
//! - **Sequential or bounded-parallel** item processing with rate limiting
//! - **Batch creates and batch associations** with per-item reconciliation
//!
//! ## Example
//!
//! ```rust,no_run
//! use crm_sync::{Config, MigrationRunner};
//!
//! #[tokio::main]
//! async fn main() -> crm_sync::Result<()> {
//!     let config = Config::load("sync.yaml")?;
//!     let runner = MigrationRunner::from_config(&config, false)?;
//!     let report = runner.run().await?;
//!     println!("Migrated {} records", report.stats.migrated);
//!     Ok(())
//! }
//! ```

pub mod associate;
pub mod auth;
pub mod config;
pub mod connectors;
pub mod core;
pub mod error;
pub mod runner;
pub mod schedule;
pub mod source;
pub mod transform;
pub mod upsert;

// Re-exports for convenient access
pub use associate::{AssociationLinker, AssociationRegistry, AssociationRequest, BatchLinkOutcome};
pub use auth::{AccessToken, TokenProvider};
pub use config::{Config, JobConfig, SourceConfig, TargetConfig};
pub use error::{ErrorClass, Result, SyncError};
pub use runner::{MigrationReport, MigrationRunner, MigrationStats, RunOptions, RunState};
pub use schedule::{BatchOptions, BatchScheduler, RateLimiter};
pub use source::SourceReader;
pub use transform::{transform, MappingTable};
pub use upsert::{UpsertCoordinator, UpsertOutcome, UpsertPolicy};
