//! Changeflow - multi-provider change ingestion and credential lifecycle
//!
//! Changeflow connects an organization to GitHub, Jira and Linear over
//! OAuth, keeps the resulting credentials encrypted at rest, and pulls
//! commits, issues and tickets into one canonical [`ChangeItem`] cache.
//!
//! # Architecture
//!
//! - **transport**: timeouts, retries with backoff, `Retry-After` handling
//! - **limiter**: per-provider concurrency permits
//! - **oauth**: authorization flow, token exchange and refresh
//! - **vault**: AES-256-GCM credential encryption
//! - **integrations**: GitHub, Jira and Linear adapters
//! - **normalize**: native records to [`ChangeItem`]
//! - **cache**: idempotent per-item upserts
//! - **store**: SQLite persistence
//! - **ingest**: token, fetch, normalize, upsert, with one refresh on 401

pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod integrations;
pub mod limiter;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod oauth;
pub mod store;
pub mod transport;
pub mod vault;

// Re-exports
pub use error::{ChangeflowError, OAuthStateError, Result};
pub use model::{ChangeItem, ChangeType, Provider};
