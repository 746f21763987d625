//! Idempotent cache writer
//!
//! Upserts normalized items keyed by organization, provider and external
//! id. Each item is written on its own; one bad item never blocks the rest
//! of the batch.

use crate::model::{ChangeItem, Provider};
use crate::store::Store;
use crate::{ChangeflowError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one batch upsert
#[derive(Debug, Default)]
pub struct UpsertReport {
    /// Items stored or overwritten
    pub written: usize,
    /// External id and cause for every item that was not stored
    pub failures: Vec<(String, ChangeflowError)>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold another batch's outcome into this one
    pub fn merge(&mut self, other: UpsertReport) {
        self.written += other.written;
        self.failures.extend(other.failures);
    }
}

/// Writes change items through the store's upsert
#[derive(Clone)]
pub struct CacheWriter {
    store: Arc<dyn Store>,
}

impl CacheWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn write_one(&self, organization_id: &str, item: &ChangeItem) -> Result<()> {
        if item.external_id.trim().is_empty() {
            return Err(ChangeflowError::Validation(format!(
                "{} {} record has no external id",
                item.provider, item.change_type
            )));
        }
        self.store.upsert_change_item(organization_id, item)
    }

    /// Upsert a batch, collecting per-item failures
    pub fn upsert(&self, organization_id: &str, items: &[ChangeItem]) -> UpsertReport {
        let mut report = UpsertReport::default();

        for item in items {
            match self.write_one(organization_id, item) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!(
                        organization = %organization_id,
                        provider = %item.provider,
                        external_id = %item.external_id,
                        error = %e,
                        "Failed to cache change item"
                    );
                    report.failures.push((item.external_id.clone(), e));
                }
            }
        }

        debug!(
            organization = %organization_id,
            written = report.written,
            failed = report.failures.len(),
            "Cache upsert complete"
        );
        report
    }

    /// Cached items for an organization, newest first
    pub fn items(
        &self,
        organization_id: &str,
        provider: Option<Provider>,
    ) -> Result<Vec<ChangeItem>> {
        self.store.list_change_items(organization_id, provider)
    }
}
