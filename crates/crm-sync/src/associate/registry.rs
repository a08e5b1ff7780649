//! Association type codes keyed by object-type pair.

use std::collections::HashMap;

use crate::config::AssociationCode;
use crate::core::AssociationEdge;
use crate::error::{Result, SyncError};

/// Registry of association type codes.
///
/// Explicitly constructed from configuration and handed to the linker;
/// codes are keyed by the ordered `(from_type, to_type)` pair, so
/// `contacts → lists` and `lists → contacts` are registered separately.
#[derive(Debug, Default, Clone)]
pub struct AssociationRegistry {
    codes: HashMap<(String, String), u32>,
}

impl AssociationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured codes.
    pub fn from_codes(codes: &[AssociationCode]) -> Self {
        let mut registry = Self::new();
        for code in codes {
            registry.register(code.from.clone(), code.to.clone(), code.type_id);
        }
        registry
    }

    /// Register the type code for a `from → to` pair.
    pub fn register(&mut self, from_type: impl Into<String>, to_type: impl Into<String>, type_id: u32) {
        self.codes.insert((from_type.into(), to_type.into()), type_id);
    }

    /// Get the type code for a pair.
    pub fn get(&self, from_type: &str, to_type: &str) -> Option<u32> {
        self.codes
            .get(&(from_type.to_string(), to_type.to_string()))
            .copied()
    }

    /// Get the type code for a pair, returning an error if none is registered.
    pub fn require(&self, from_type: &str, to_type: &str) -> Result<u32> {
        self.get(from_type, to_type).ok_or_else(|| {
            SyncError::Configuration(format!(
                "no association type registered for {} -> {}",
                from_type, to_type
            ))
        })
    }

    /// Check if a pair is registered.
    pub fn contains(&self, from_type: &str, to_type: &str) -> bool {
        self.get(from_type, to_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Build an edge for two existing entities.
    ///
    /// Fails without side effects if an id is empty or the pair has no code.
    pub fn edge(
        &self,
        from_type: &str,
        from_id: &str,
        to_type: &str,
        to_id: &str,
    ) -> Result<AssociationEdge> {
        if from_id.trim().is_empty() || to_id.trim().is_empty() {
            return Err(SyncError::Validation(format!(
                "association {} -> {} needs both ids (from '{}', to '{}')",
                from_type, to_type, from_id, to_id
            )));
        }
        let association_type_id = self.require(from_type, to_type)?;
        Ok(AssociationEdge {
            from_type: from_type.to_string(),
            from_id: from_id.to_string(),
            to_type: to_type.to_string(),
            to_id: to_id.to_string(),
            association_type_id,
        })
    }
}
