//! Concrete source and target connectors.
//!
//! - [`http`]: generic paginated REST source
//! - [`hubspot`]: HubSpot CRM target
//! - [`memory`]: in-process source and target for dry runs and tests

pub mod http;
pub mod hubspot;
pub mod memory;

pub use http::HttpSource;
pub use hubspot::HubSpotTarget;
pub use memory::{InMemorySource, InMemoryTarget};

use std::sync::Arc;

use tracing::info;

use crate::auth::TokenProvider;
use crate::config::{SourceConfig, TargetConfig, TargetType};
use crate::core::{SourceConnector, TargetConnector};
use crate::error::{Result, SyncError};

/// Build the source connector and its token provider from configuration.
pub fn create_source(
    config: &SourceConfig,
) -> Result<(Arc<dyn SourceConnector>, Arc<TokenProvider>)> {
    let client = http::build_client(config.timeout())?;
    let tokens = Arc::new(TokenProvider::from_config(&config.auth, client.clone()));
    let source = HttpSource::with_client(config.clone(), client);
    info!("Source: {}", source.url());
    Ok((Arc::new(source), tokens))
}

/// Build the target connector from configuration.
///
/// `dry_run` swaps any remote target for an in-memory one.
pub fn create_target(config: &TargetConfig, dry_run: bool) -> Result<Arc<dyn TargetConnector>> {
    if dry_run || config.r#type == TargetType::Memory {
        info!("Target: in-memory{}", if dry_run { " (dry run)" } else { "" });
        return Ok(Arc::new(InMemoryTarget::new()));
    }
    let auth = config.auth.as_ref().ok_or_else(|| {
        SyncError::Configuration("target.auth is required for hubspot targets".into())
    })?;
    let client = http::build_client(config.timeout())?;
    let tokens = Arc::new(TokenProvider::from_config(auth, client.clone()));
    info!("Target: hubspot at {}", config.base_url);
    Ok(Arc::new(HubSpotTarget::new(
        client,
        config.base_url.clone(),
        tokens,
    )))
}
