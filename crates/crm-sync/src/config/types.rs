//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::PaginationStyle;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source API configuration.
    pub source: SourceConfig,

    /// Target API configuration.
    pub target: TargetConfig,

    /// What to synchronize and how fast.
    pub job: JobConfig,

    /// Registered association type codes, keyed by `(from, to)`.
    #[serde(default)]
    pub associations: Vec<AssociationCode>,
}

/// Bearer-token configuration for a remote system.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Pre-issued token (private-app key). Cannot be refreshed.
    Static { token: String },

    /// OAuth2 client-credentials grant.
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        #[serde(default)]
        method: TokenRequestMethod,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::Static { .. } => f
                .debug_struct("Static")
                .field("token", &"[REDACTED]")
                .finish(),
            AuthConfig::ClientCredentials {
                token_url,
                client_id,
                scope,
                method,
                ..
            } => f
                .debug_struct("ClientCredentials")
                .field("token_url", token_url)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .field("scope", scope)
                .field("method", method)
                .finish(),
        }
    }
}

/// How the token endpoint expects the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRequestMethod {
    /// Form-encoded POST body.
    #[default]
    Post,
    /// Query parameters on a GET request.
    Get,
}

/// Source API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL, e.g. `https://123-ABC-456.mktorest.com`.
    pub base_url: String,

    /// Endpoint path appended to the base URL.
    pub endpoint: String,

    /// Bearer-token configuration.
    pub auth: AuthConfig,

    /// Pagination parameters.
    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Dotted path to the records array in the response body (default: "result").
    #[serde(default = "default_records_path")]
    pub records_path: String,

    /// Field holding the source-native id (default: "id").
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Records requested per page (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Extra query parameters sent with every page request.
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for transient failures per page (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries in milliseconds (default: 500).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Pagination parameters for the source endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Offset/limit or opaque token (default: offset).
    #[serde(default)]
    pub style: PaginationStyle,

    /// Query parameter carrying the offset (default: "offset").
    #[serde(default = "default_offset_param")]
    pub offset_param: String,

    /// Query parameter carrying the page size (default: "limit").
    #[serde(default = "default_limit_param")]
    pub limit_param: String,

    /// Query parameter carrying the continuation token (default: "nextPageToken").
    #[serde(default = "default_token_param")]
    pub token_param: String,

    /// Dotted path to the next token in the response body (default: "nextPageToken").
    #[serde(default = "default_token_param")]
    pub next_token_path: String,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            style: PaginationStyle::default(),
            offset_param: default_offset_param(),
            limit_param: default_limit_param(),
            token_param: default_token_param(),
            next_token_path: default_token_param(),
        }
    }
}

/// Target system kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// HubSpot-style CRM REST API.
    #[default]
    Hubspot,
    /// In-process store; nothing leaves the machine.
    Memory,
}

/// Target API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target kind (default: hubspot).
    #[serde(default)]
    pub r#type: TargetType,

    /// Base URL (default: "https://api.hubapi.com").
    #[serde(default = "default_target_base_url")]
    pub base_url: String,

    /// Bearer-token configuration; required for remote targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What to do when the natural key already exists in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertPolicy {
    /// Leave the existing record untouched.
    #[default]
    SkipExisting,
    /// Patch the existing record with the transformed fields.
    Update,
}

/// How created records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// One lookup-then-write per record.
    #[default]
    Single,
    /// Lookups for the whole page first, then batched creates.
    Batch,
    /// Only look records up by natural key and link them; nothing is created
    /// or updated. A miss counts as not found.
    LookupOnly,
}

/// Whether the runner follows the cursor past the first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    /// Follow the cursor until the source is exhausted.
    #[default]
    Full,
    /// Process the first page only.
    SinglePage,
}

/// Link each migrated record to an existing entity of another type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationRule {
    /// Object type of the other endpoint.
    pub to_type: String,

    /// Transformed field whose value identifies the other endpoint.
    pub from_field: String,

    /// Target property to search the other endpoint by.
    pub lookup_property: String,
}

/// Registered association type code for a `(from, to)` object-type pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationCode {
    pub from: String,
    pub to: String,
    pub type_id: u32,
}

/// Job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name for log lines.
    pub name: String,

    /// Path to the mapping table (YAML or JSON).
    pub mapping: PathBuf,

    /// Policy for records that already exist (default: skip_existing).
    #[serde(default)]
    pub on_existing: UpsertPolicy,

    /// Write mode (default: single).
    #[serde(default)]
    pub write_mode: WriteMode,

    /// Records per batch create / association batch (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Items in flight per page (default: 1, strictly sequential).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum spacing between item starts in milliseconds (default: 100).
    #[serde(default = "default_item_delay_ms")]
    pub inter_item_delay_ms: u64,

    /// Pause between pages in milliseconds (default: 100).
    #[serde(default = "default_item_delay_ms")]
    pub page_delay_ms: u64,

    /// Full pagination or first page only (default: full).
    #[serde(default)]
    pub pagination_mode: PaginationMode,

    /// Optional cap on pages processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,

    /// Retries for transient write failures per item (default: 2).
    #[serde(default = "default_item_retries")]
    pub max_item_retries: u32,

    /// Serialize upserts per natural key. Defaults to on when concurrency > 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_keys: Option<bool>,

    /// Optional association created for each migrated record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association: Option<AssociationRule>,
}

impl JobConfig {
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    /// Effective per-key locking flag.
    pub fn lock_keys(&self) -> bool {
        self.lock_keys.unwrap_or(self.concurrency > 1)
    }
}

// Default value functions for serde
fn default_records_path() -> String {
    "result".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_limit_param() -> String {
    "limit".to_string()
}

fn default_token_param() -> String {
    "nextPageToken".to_string()
}

fn default_target_base_url() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_concurrency() -> usize {
    1
}

fn default_item_delay_ms() -> u64 {
    100
}

fn default_item_retries() -> u32 {
    2
}
