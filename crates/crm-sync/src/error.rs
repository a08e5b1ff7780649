//! Error types for the synchronization library.

use thiserror::Error;

/// How an error is handled by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff (timeouts, 429, 5xx).
    Transient,
    /// Credentials rejected; one refresh-retry is allowed.
    Auth,
    /// Expected miss; drives the create branch.
    NotFound,
    /// Fails the current item only.
    Item,
    /// Halts the whole run.
    Fatal,
}

/// Main error type for synchronization operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network-level failure that may succeed on retry.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Bearer token rejected by the remote system.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Remote entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing mapping, association code or invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Record is missing a required transformed field or holds an invalid value.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A page could not be fetched, even after retrying.
    #[error("Fetch failed at cursor {cursor}: {source}")]
    Fetch {
        cursor: String,
        #[source]
        source: Box<SyncError>,
    },

    /// One item of a non-atomic batch call failed.
    #[error("Batch item failed: {0}")]
    BatchItem(String),

    /// Remote system refused the request (non-auth 4xx).
    #[error("Request rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// HTTP client error that could not be classified more precisely.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a Fetch error for the given cursor description.
    pub fn fetch(cursor: impl Into<String>, source: SyncError) -> Self {
        SyncError::Fetch {
            cursor: cursor.into(),
            source: Box::new(source),
        }
    }

    /// Map an HTTP status and response body to an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => SyncError::Auth(format!("HTTP {}: {}", status, body)),
            404 => SyncError::NotFound(body),
            408 | 429 | 500..=599 => {
                SyncError::TransientNetwork(format!("HTTP {}: {}", status, body))
            }
            _ => SyncError::Rejected {
                status,
                message: body,
            },
        }
    }

    /// Classify a reqwest transport error.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return SyncError::TransientNetwork(err.to_string());
        }
        SyncError::Http(err)
    }

    /// Classification used by retry loops and the runner.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::TransientNetwork(_) => ErrorClass::Transient,
            SyncError::Auth(_) => ErrorClass::Auth,
            SyncError::NotFound(_) => ErrorClass::NotFound,
            SyncError::Configuration(_)
            | SyncError::Validation(_)
            | SyncError::Rejected { .. }
            | SyncError::BatchItem(_)
            | SyncError::Http(_)
            | SyncError::Json(_) => ErrorClass::Item,
            // Retries are already exhausted by the time a fetch error exists.
            SyncError::Fetch { .. } => ErrorClass::Fatal,
            SyncError::Io(_) | SyncError::Yaml(_) => ErrorClass::Fatal,
        }
    }

    /// Whether this error must halt the run.
    ///
    /// An `Auth` error that reaches the runner has already been through its
    /// single refresh-retry, so it is treated as a permanent rejection.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal | ErrorClass::Auth)
    }

    /// Copy of this error for every item of a failed batch call.
    ///
    /// Keeps the classification; the message is carried as text.
    pub fn for_batch_item(&self) -> SyncError {
        match self.class() {
            ErrorClass::Transient => SyncError::TransientNetwork(self.to_string()),
            ErrorClass::Auth => SyncError::Auth(self.to_string()),
            ErrorClass::NotFound => SyncError::NotFound(self.to_string()),
            ErrorClass::Item | ErrorClass::Fatal => SyncError::BatchItem(self.to_string()),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        1
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
