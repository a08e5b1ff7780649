//! OAuth2 client-credentials token source.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use crate::config::{AuthConfig, TokenRequestMethod};
use crate::error::{Result, SyncError};

use super::{IssuedToken, TokenSource};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Issues tokens from an OAuth2 `client_credentials` endpoint.
///
/// Some issuers expect the grant as GET query parameters, others as a POST
/// form body; [`TokenRequestMethod`] selects which.
pub struct ClientCredentialsSource {
    config: AuthConfig,
    client: reqwest::Client,
}

impl ClientCredentialsSource {
    pub fn new(config: AuthConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn grant_params(&self) -> Vec<(&'static str, String)> {
        let AuthConfig::ClientCredentials {
            client_id,
            client_secret,
            scope,
            ..
        } = &self.config
        else {
            return Vec::new();
        };
        let mut params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.clone()),
            ("client_secret", client_secret.clone()),
        ];
        if let Some(scope) = scope {
            params.push(("scope", scope.clone()));
        }
        params
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    #[instrument(level = "debug", skip(self))]
    async fn request_token(&self) -> Result<IssuedToken> {
        let AuthConfig::ClientCredentials {
            token_url, method, ..
        } = &self.config
        else {
            return Err(SyncError::Configuration(
                "client credentials source built from a non-oauth auth config".into(),
            ));
        };

        let params = self.grant_params();
        let request = match method {
            TokenRequestMethod::Get => self.client.get(token_url).query(&params),
            TokenRequestMethod::Post => self.client.post(token_url).form(&params),
        };

        let resp = request.send().await.map_err(SyncError::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // A rejected grant cannot be fixed by asking again.
            return Err(match SyncError::from_status(status.as_u16(), body) {
                SyncError::Rejected { status, message } => {
                    SyncError::Auth(format!("token endpoint returned {}: {}", status, message))
                }
                other => other,
            });
        }

        let body: TokenResponse = resp.json().await.map_err(SyncError::from_reqwest)?;
        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Auth("token endpoint response has no access_token".into()))?;

        Ok(IssuedToken {
            access_token,
            expires_in: body.expires_in.map(Duration::from_secs),
        })
    }

    fn name(&self) -> &str {
        match &self.config {
            AuthConfig::ClientCredentials { token_url, .. } => token_url,
            AuthConfig::Static { .. } => "static",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_params_include_scope() {
        let source = ClientCredentialsSource::new(
            AuthConfig::ClientCredentials {
                token_url: "https://login.example.com/token".into(),
                client_id: "id".into(),
                client_secret: "secret".into(),
                scope: Some("https://org.example.com/.default".into()),
                method: TokenRequestMethod::Post,
            },
            reqwest::Client::new(),
        );
        let params = source.grant_params();
        assert_eq!(params[0], ("grant_type", "client_credentials".to_string()));
        assert!(params.iter().any(|(k, _)| *k == "scope"));
        assert_eq!(source.name(), "https://login.example.com/token");
    }

    #[test]
    fn test_token_response_tolerates_missing_expiry() {
        let body: TokenResponse = serde_json::from_str(r#"{"access_token":"abc"}"#).unwrap();
        assert_eq!(body.access_token.as_deref(), Some("abc"));
        assert_eq!(body.expires_in, None);
    }
}
