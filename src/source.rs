//! Run-scoped source unit resolution.

use crate::error::SourceError;
use crate::layout::{is_valid_unit_name, UnitLayout};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Raw, uncached access to source units in the remote tree.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Read the full text of `unit` (already validated) at `branch_ref`.
    async fn read(&self, unit: &str, branch_ref: &str) -> Result<String, SourceError>;
}

/// Memoizing front for a [`SourceReader`], owned by exactly one run.
///
/// A name is read from the transport at most once; failures are not cached.
pub struct SourceResolver {
    reader: Arc<dyn SourceReader>,
    layout: UnitLayout,
    branch_ref: String,
    cache: HashMap<String, String>,
    order: Vec<String>,
}

impl SourceResolver {
    pub fn new(reader: Arc<dyn SourceReader>, layout: UnitLayout, branch_ref: &str) -> Self {
        Self {
            reader,
            layout,
            branch_ref: branch_ref.to_string(),
            cache: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Canonical form of a requested name, or an error if it is not a bare identifier.
    pub fn canonical_name(&self, unit: &str) -> Result<String, SourceError> {
        let name = self.layout.normalize(unit);
        if !is_valid_unit_name(name) {
            return Err(SourceError::FetchFailed {
                unit: unit.trim().to_string(),
                reason: "not a valid class name".to_string(),
            });
        }
        Ok(name.to_string())
    }

    pub async fn fetch(&mut self, unit: &str) -> Result<String, SourceError> {
        let name = self.canonical_name(unit)?;
        if let Some(content) = self.cache.get(&name) {
            tracing::debug!(unit = %name, "source cache hit");
            return Ok(content.clone());
        }

        let content = self.reader.read(&name, &self.branch_ref).await?;
        tracing::debug!(unit = %name, bytes = content.len(), "fetched source unit");
        self.order.push(name.clone());
        self.cache.insert(name, content.clone());
        Ok(content)
    }

    pub fn is_cached(&self, unit: &str) -> bool {
        self.canonical_name(unit)
            .map(|name| self.cache.contains_key(&name))
            .unwrap_or(false)
    }

    /// Names fetched so far, in first-fetch order.
    pub fn fetched_units(&self) -> &[String] {
        &self.order
    }
}
