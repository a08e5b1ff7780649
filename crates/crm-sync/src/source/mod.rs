//! Paginated reads from a source system.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::{with_token_refresh, TokenProvider};
use crate::config::SourceConfig;
use crate::core::cursor::describe;
use crate::core::{Cursor, Page, PageRequest, PaginationStyle, SourceConnector, SourceRecord};
use crate::error::{Result, SyncError};
use crate::schedule::retry_transient;

/// Reads pages through a [`SourceConnector`], hiding the pagination style.
///
/// Holds no state between pages: the caller passes the cursor returned with
/// the previous page.
pub struct SourceReader {
    connector: Arc<dyn SourceConnector>,
    tokens: Arc<TokenProvider>,
    style: PaginationStyle,
    page_size: u32,
    id_field: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl SourceReader {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        tokens: Arc<TokenProvider>,
        style: PaginationStyle,
        page_size: u32,
    ) -> Self {
        Self {
            connector,
            tokens,
            style,
            page_size: page_size.max(1),
            id_field: "id".to_string(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    /// Build a reader from source configuration.
    pub fn from_config(
        config: &SourceConfig,
        connector: Arc<dyn SourceConnector>,
        tokens: Arc<TokenProvider>,
    ) -> Self {
        Self::new(connector, tokens, config.pagination.style, config.page_size)
            .with_id_field(config.id_field.clone())
            .with_retry(config.max_retries, config.retry_base_delay())
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn style(&self) -> PaginationStyle {
        self.style
    }

    /// Cursor for the first page. Token-paginated sources start without one.
    pub fn first_cursor(&self) -> Option<Cursor> {
        match self.style {
            PaginationStyle::Offset => Some(Cursor::Offset {
                offset: 0,
                limit: self.page_size,
            }),
            PaginationStyle::Token => None,
        }
    }

    /// Fetch one page and compute the cursor of the next one.
    ///
    /// Transient failures are retried with backoff and a rejected token is
    /// refreshed once. Anything still failing is returned as
    /// [`SyncError::Fetch`].
    pub async fn fetch(&self, cursor: Option<&Cursor>) -> Result<Page> {
        let at = describe(cursor);
        let request = self.request_for(cursor).map_err(|e| SyncError::fetch(&at, e))?;

        debug!("Fetching page from {} at {}", self.connector.name(), at);
        // One refresh per page, shared by every transient retry.
        let raw = {
            let connector = &self.connector;
            let request = &request;
            let what = format!("fetch at {}", at);
            let what = what.as_str();
            let (max_retries, base_delay) = (self.max_retries, self.retry_base_delay);
            with_token_refresh(self.tokens.as_ref(), move |token| async move {
                let token = &token;
                retry_transient(what, max_retries, base_delay, move || {
                    connector.fetch_page(request, token)
                })
                .await
            })
            .await
            .map_err(|e| SyncError::fetch(&at, e))?
        };

        let records: Vec<SourceRecord> = raw
            .items
            .into_iter()
            .map(|item| SourceRecord::from_json(item, &self.id_field))
            .collect();

        let next = match (self.style, &request.cursor) {
            (PaginationStyle::Offset, Some(Cursor::Offset { offset, limit })) => {
                if records.is_empty() {
                    None
                } else {
                    Some(Cursor::Offset {
                        offset: offset + records.len() as u64,
                        limit: *limit,
                    })
                }
            }
            (PaginationStyle::Token, _) => raw
                .next_token
                .filter(|t| !t.is_empty())
                .map(Cursor::Token),
            _ => None,
        };

        if records.is_empty() && next.is_some() {
            warn!("Source returned an empty page with a continuation cursor at {}", at);
        }
        info!(
            "Fetched {} records at {} ({})",
            records.len(),
            at,
            if next.is_some() { "more pages" } else { "last page" }
        );

        Ok(Page { records, next })
    }

    fn request_for(&self, cursor: Option<&Cursor>) -> Result<PageRequest> {
        let cursor = match (self.style, cursor) {
            (PaginationStyle::Offset, None) => self.first_cursor(),
            (PaginationStyle::Offset, Some(c @ Cursor::Offset { .. }))
            | (PaginationStyle::Token, Some(c @ Cursor::Token(_))) => Some(c.clone()),
            (PaginationStyle::Token, None) => None,
            (style, Some(other)) => {
                return Err(SyncError::Configuration(format!(
                    "cursor {} does not match {:?} pagination",
                    other, style
                )))
            }
        };
        Ok(PageRequest {
            page_size: self.page_size,
            cursor,
        })
    }
}
