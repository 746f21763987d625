//! Persistence contract
//!
//! The engine keeps no long-lived state of its own. Integrations, one-time
//! OAuth state and cached change items live behind [`Store`]; the bundled
//! implementation is SQLite.

mod sqlite;

pub use sqlite::{SqliteStore, StoreConfig};

use crate::model::{ChangeItem, IntegrationRecord, OAuthStateRecord, Provider};
use crate::Result;
use chrono::{DateTime, Utc};

/// Record-read / record-upsert contract consumed by the engine
///
/// Implementations must make [`Store::consume_oauth_state`] an atomic
/// check-and-delete and every upsert a whole-record write.
pub trait Store: Send + Sync {
    /// Fetch the integration for an organization, validated into a typed record
    fn get_integration(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<Option<IntegrationRecord>>;

    /// Insert or replace the integration keyed by organization and provider
    fn upsert_integration(&self, record: &IntegrationRecord) -> Result<()>;

    fn save_oauth_state(&self, record: &OAuthStateRecord) -> Result<()>;

    /// Atomically remove and return the state record.
    ///
    /// Fails with [`crate::OAuthStateError::NotFound`] for unknown or reused
    /// states. A state presented by the wrong user or for the wrong provider
    /// is rejected without being consumed.
    fn consume_oauth_state(
        &self,
        provider: Provider,
        state: &str,
        user_id: &str,
    ) -> Result<OAuthStateRecord>;

    /// Delete state records that expired before `now`; returns the count removed
    fn purge_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Insert or overwrite one change item keyed by organization, provider and external id
    fn upsert_change_item(&self, organization_id: &str, item: &ChangeItem) -> Result<()>;

    /// Cached items for an organization, newest first
    fn list_change_items(
        &self,
        organization_id: &str,
        provider: Option<Provider>,
    ) -> Result<Vec<ChangeItem>>;
}
