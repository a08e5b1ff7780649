//! Pagination cursors.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::record::SourceRecord;

/// Pagination style of a source endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    /// Numeric offset plus page size.
    #[default]
    Offset,
    /// Opaque continuation token returned by the source.
    Token,
}

/// Position of the next page to fetch.
///
/// Cursors only move forward; a restarted process begins again from the
/// first page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    Offset { offset: u64, limit: u32 },
    Token(String),
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Offset { offset, limit } => write!(f, "offset={} limit={}", offset, limit),
            Cursor::Token(token) => write!(f, "token={}", token),
        }
    }
}

/// Describe an optional cursor for log lines and errors.
pub fn describe(cursor: Option<&Cursor>) -> String {
    cursor
        .map(|c| c.to_string())
        .unwrap_or_else(|| "start".to_string())
}

/// Request handed to a source connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Page size requested from the source.
    pub page_size: u32,
    /// Position to fetch; `None` means the first page of a token-paginated source.
    pub cursor: Option<Cursor>,
}

/// One page of source records and the cursor for the next one.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    pub next: Option<Cursor>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
