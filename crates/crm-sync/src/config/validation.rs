//! Configuration validation.

use super::{AuthConfig, Config, TargetType, WriteMode};
use crate::error::{Result, SyncError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    validate_url("source.base_url", &config.source.base_url)?;
    if config.source.endpoint.is_empty() {
        return Err(SyncError::Configuration(
            "source.endpoint is required".into(),
        ));
    }
    validate_auth("source.auth", &config.source.auth)?;
    if config.source.page_size == 0 {
        return Err(SyncError::Configuration(
            "source.page_size must be at least 1".into(),
        ));
    }
    if config.source.id_field.is_empty() {
        return Err(SyncError::Configuration(
            "source.id_field must not be empty".into(),
        ));
    }

    // Target validation
    if config.target.r#type == TargetType::Hubspot {
        validate_url("target.base_url", &config.target.base_url)?;
        match &config.target.auth {
            Some(auth) => validate_auth("target.auth", auth)?,
            None => {
                return Err(SyncError::Configuration(
                    "target.auth is required for hubspot targets".into(),
                ))
            }
        }
    }

    // Job validation
    if config.job.name.is_empty() {
        return Err(SyncError::Configuration("job.name is required".into()));
    }
    if config.job.mapping.as_os_str().is_empty() {
        return Err(SyncError::Configuration("job.mapping is required".into()));
    }
    if config.job.concurrency == 0 {
        return Err(SyncError::Configuration(
            "job.concurrency must be at least 1".into(),
        ));
    }
    if config.job.batch_size == 0 || config.job.batch_size > 100 {
        return Err(SyncError::Configuration(format!(
            "job.batch_size must be between 1 and 100, got {}",
            config.job.batch_size
        )));
    }
    if let Some(0) = config.job.max_pages {
        return Err(SyncError::Configuration(
            "job.max_pages must be at least 1".into(),
        ));
    }
    if config.job.write_mode == WriteMode::LookupOnly && config.job.association.is_none() {
        return Err(SyncError::Configuration(
            "job.write_mode lookup_only requires job.association".into(),
        ));
    }
    if let Some(rule) = &config.job.association {
        if rule.to_type.is_empty() || rule.from_field.is_empty() || rule.lookup_property.is_empty()
        {
            return Err(SyncError::Configuration(
                "job.association requires to_type, from_field and lookup_property".into(),
            ));
        }
    }

    // Association codes: one code per ordered pair
    for (i, code) in config.associations.iter().enumerate() {
        if code.from.is_empty() || code.to.is_empty() {
            return Err(SyncError::Configuration(format!(
                "associations[{}] requires from and to",
                i
            )));
        }
        if config.associations[..i]
            .iter()
            .any(|c| c.from == code.from && c.to == code.to)
        {
            return Err(SyncError::Configuration(format!(
                "duplicate association code for ({}, {})",
                code.from, code.to
            )));
        }
    }

    Ok(())
}

fn validate_url(field: &str, url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(SyncError::Configuration(format!("{} is required", field)));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(SyncError::Configuration(format!(
            "{} must start with http:// or https://, got '{}'",
            field, url
        )));
    }
    Ok(())
}

fn validate_auth(field: &str, auth: &AuthConfig) -> Result<()> {
    match auth {
        AuthConfig::Static { token } if token.is_empty() => Err(SyncError::Configuration(
            format!("{}.token must not be empty", field),
        )),
        AuthConfig::ClientCredentials {
            token_url,
            client_id,
            client_secret,
            ..
        } => {
            validate_url(&format!("{}.token_url", field), token_url)?;
            if client_id.is_empty() || client_secret.is_empty() {
                return Err(SyncError::Configuration(format!(
                    "{} requires client_id and client_secret",
                    field
                )));
            }
            Ok(())
        }
        AuthConfig::Static { .. } => Ok(()),
    }
}
