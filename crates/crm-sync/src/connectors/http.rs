//! Generic paginated REST source.
//!
//! Reads a JSON endpoint page by page. Where the records and the continuation
//! token live in the response body is configured with dotted paths, which
//! covers Marketo-style (`result` + `nextPageToken`) and most other list APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::auth::AccessToken;
use crate::config::SourceConfig;
use crate::core::{Cursor, PageRequest, RawPage, SourceConnector};
use crate::error::{Result, SyncError};

/// Envelope error codes meaning the bearer token is invalid or expired.
const TOKEN_ERROR_CODES: &[&str] = &["601", "602"];

/// Envelope error codes meaning the caller is being throttled.
const THROTTLE_ERROR_CODES: &[&str] = &["606", "615"];

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    message: String,
}

/// Build an HTTP client with the given request timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::Configuration(format!("cannot build HTTP client: {}", e)))
}

/// Source connector for a JSON list endpoint.
pub struct HttpSource {
    client: Client,
    config: SourceConfig,
    url: String,
}

impl HttpSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = build_client(config.timeout())?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: SourceConfig, client: Client) -> Self {
        let url = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            config.endpoint.trim_start_matches('/')
        );
        Self {
            client,
            config,
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query parameters for one page request.
    fn page_query(&self, request: &PageRequest) -> Vec<(String, String)> {
        let pagination = &self.config.pagination;
        let mut query: Vec<(String, String)> = self
            .config
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        match &request.cursor {
            Some(Cursor::Offset { offset, limit }) => {
                query.push((pagination.offset_param.clone(), offset.to_string()));
                query.push((pagination.limit_param.clone(), limit.to_string()));
            }
            Some(Cursor::Token(token)) => {
                query.push((pagination.limit_param.clone(), request.page_size.to_string()));
                query.push((pagination.token_param.clone(), token.clone()));
            }
            None => {
                query.push((pagination.limit_param.clone(), request.page_size.to_string()));
            }
        }
        query
    }

    /// Extract items and the continuation token from a response body.
    fn parse_body(&self, body: Value) -> Result<RawPage> {
        check_envelope(&body)?;

        let items = match lookup(&body, &self.config.records_path) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(SyncError::Validation(format!(
                    "expected an array at '{}', got {}",
                    self.config.records_path,
                    type_name(other)
                )))
            }
        };
        let next_token = lookup(&body, &self.config.pagination.next_token_path)
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty());

        Ok(RawPage { items, next_token })
    }
}

#[async_trait]
impl SourceConnector for HttpSource {
    #[instrument(level = "debug", skip(self, token), fields(url = %self.url))]
    async fn fetch_page(&self, request: &PageRequest, token: &AccessToken) -> Result<RawPage> {
        let query = self.page_query(request);
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(token.value())
            .query(&query)
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), body));
        }

        let body: Value = resp.json().await.map_err(SyncError::from_reqwest)?;
        let page = self.parse_body(body)?;
        debug!(
            "{} returned {} items (next token: {})",
            self.url,
            page.items.len(),
            page.next_token.is_some()
        );
        Ok(page)
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// Map `{"success": false, "errors": [...]}` bodies, which some APIs send
/// with HTTP 200, onto the usual error classes.
fn check_envelope(body: &Value) -> Result<()> {
    if body.get("success").and_then(Value::as_bool) != Some(false) {
        return Ok(());
    }
    let errors: Vec<EnvelopeError> = body
        .get("errors")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let first = errors.first();
    let code = first
        .map(|e| match &e.code {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    let message = first
        .map(|e| format!("{} ({})", e.message, code))
        .unwrap_or_else(|| "request unsuccessful".to_string());

    Err(if TOKEN_ERROR_CODES.contains(&code.as_str()) {
        SyncError::Auth(message)
    } else if THROTTLE_ERROR_CODES.contains(&code.as_str()) {
        SyncError::TransientNetwork(message)
    } else {
        SyncError::Rejected {
            status: 200,
            message,
        }
    })
}

/// Follow a dotted path; an empty path is the value itself.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, PaginationConfig};
    use crate::core::PaginationStyle;
    use crate::error::ErrorClass;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn source(style: PaginationStyle) -> HttpSource {
        let mut query = BTreeMap::new();
        query.insert("fields".to_string(), "id,name".to_string());
        let config = SourceConfig {
            base_url: "https://123-ABC-456.mktorest.com/".into(),
            endpoint: "/rest/asset/v1/programs.json".into(),
            auth: AuthConfig::Static { token: "t".into() },
            pagination: PaginationConfig {
                style,
                limit_param: "maxReturn".into(),
                ..PaginationConfig::default()
            },
            records_path: "result".into(),
            id_field: "id".into(),
            page_size: 200,
            query,
            timeout_secs: 5,
            max_retries: 0,
            retry_base_delay_ms: 0,
        };
        HttpSource::with_client(config, Client::new())
    }

    #[test]
    fn test_url_joins_base_and_endpoint() {
        assert_eq!(
            source(PaginationStyle::Offset).url(),
            "https://123-ABC-456.mktorest.com/rest/asset/v1/programs.json"
        );
    }

    #[test]
    fn test_offset_query() {
        let request = PageRequest {
            page_size: 200,
            cursor: Some(Cursor::Offset {
                offset: 400,
                limit: 200,
            }),
        };
        let query = source(PaginationStyle::Offset).page_query(&request);
        assert!(query.contains(&("fields".into(), "id,name".into())));
        assert!(query.contains(&("offset".into(), "400".into())));
        assert!(query.contains(&("maxReturn".into(), "200".into())));
    }

    #[test]
    fn test_token_query() {
        let request = PageRequest {
            page_size: 300,
            cursor: Some(Cursor::Token("XYZ".into())),
        };
        let query = source(PaginationStyle::Token).page_query(&request);
        assert!(query.contains(&("nextPageToken".into(), "XYZ".into())));
        assert!(query.contains(&("maxReturn".into(), "300".into())));
    }

    #[test]
    fn test_parse_body() {
        let page = source(PaginationStyle::Token)
            .parse_body(json!({
                "success": true,
                "result": [{"id": 1}, {"id": 2}],
                "nextPageToken": "ABC"
            }))
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_token.as_deref(), Some("ABC"));
    }

    #[test]
    fn test_missing_result_is_empty_page() {
        let page = source(PaginationStyle::Offset)
            .parse_body(json!({"success": true, "warnings": ["No assets found"]}))
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn test_envelope_errors_are_classified() {
        let s = source(PaginationStyle::Offset);
        let expired = s
            .parse_body(json!({"success": false, "errors": [{"code": "602", "message": "Access token expired"}]}))
            .unwrap_err();
        assert_eq!(expired.class(), ErrorClass::Auth);

        let throttled = s
            .parse_body(json!({"success": false, "errors": [{"code": 606, "message": "Max rate limit"}]}))
            .unwrap_err();
        assert_eq!(throttled.class(), ErrorClass::Transient);

        let other = s
            .parse_body(json!({"success": false, "errors": [{"code": "610", "message": "Not found"}]}))
            .unwrap_err();
        assert_eq!(other.class(), ErrorClass::Item);
    }

    #[test]
    fn test_non_array_records_are_rejected() {
        let err = source(PaginationStyle::Offset)
            .parse_body(json!({"result": {"id": 1}}))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
