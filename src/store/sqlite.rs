//! SQLite store implementation

use super::Store;
use crate::error::OAuthStateError;
use crate::model::{
    ChangeItem, ChangeType, IntegrationConfig, IntegrationRecord, OAuthStateRecord, Provider,
};
use crate::{ChangeflowError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to SQLite database file
    pub path: PathBuf,

    /// Enable WAL mode for better concurrency
    pub wal_mode: bool,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wal_mode: true,
        }
    }
}

/// SQLite-backed [`Store`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a store database
    pub fn new(config: StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %config.path.display(), "Opening store database");

        let conn = Connection::open(&config.path)?;

        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(config.path),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Database path, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChangeflowError::Other("Store connection lock poisoned".to_string()))
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_states (
                state TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                user_id TEXT NOT NULL,
                pkce_verifier TEXT,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS integrations (
                organization_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                encrypted_credentials TEXT NOT NULL,
                config TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (organization_id, provider)
            );

            CREATE TABLE IF NOT EXISTS change_items (
                organization_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_id TEXT NOT NULL,
                change_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                url TEXT,
                assignee TEXT,
                labels TEXT NOT NULL,
                created_at TEXT,
                updated_at TEXT,
                raw TEXT NOT NULL,
                cached_at TEXT NOT NULL,
                PRIMARY KEY (organization_id, provider, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_oauth_states_expires ON oauth_states(expires_at);
            CREATE INDEX IF NOT EXISTS idx_change_items_updated ON change_items(organization_id, updated_at);
            "#,
        )?;

        Ok(())
    }

    /// Why a state could not be consumed for this provider and user
    fn diagnose_state(
        conn: &Connection,
        provider: Provider,
        state: &str,
        user_id: &str,
    ) -> Result<OAuthStateError> {
        let found: Option<(String, String)> = conn
            .query_row(
                "SELECT provider, user_id FROM oauth_states WHERE state = ?1",
                params![state],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(match found {
            None => OAuthStateError::NotFound,
            Some((stored_provider, _)) if stored_provider != provider.as_str() => {
                OAuthStateError::ProviderMismatch {
                    expected: parse_provider(&stored_provider)?,
                    actual: provider,
                }
            }
            Some((_, owner)) if owner != user_id => OAuthStateError::OwnerMismatch,
            Some(_) => OAuthStateError::NotFound,
        })
    }
}

impl Store for SqliteStore {
    fn get_integration(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<Option<IntegrationRecord>> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT organization_id, provider, encrypted_credentials, config, is_active, updated_at
                FROM integrations
                WHERE organization_id = ?1 AND provider = ?2
                "#,
                params![organization_id, provider.as_str()],
                |row| {
                    Ok(IntegrationRow {
                        organization_id: row.get(0)?,
                        provider: row.get(1)?,
                        encrypted_credentials: row.get(2)?,
                        config: row.get(3)?,
                        is_active: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;

        row.map(IntegrationRow::validate).transpose()
    }

    fn upsert_integration(&self, record: &IntegrationRecord) -> Result<()> {
        let config = serde_json::to_string(&record.config)?;

        self.conn()?.execute(
            r#"
            INSERT INTO integrations (
                organization_id, provider, encrypted_credentials, config, is_active, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (organization_id, provider) DO UPDATE SET
                encrypted_credentials = excluded.encrypted_credentials,
                config = excluded.config,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
            params![
                &record.organization_id,
                record.provider.as_str(),
                &record.encrypted_credentials,
                config,
                record.is_active,
                format_time(record.updated_at),
            ],
        )?;

        tracing::debug!(
            organization = %record.organization_id,
            provider = %record.provider,
            active = record.is_active,
            "Integration upserted"
        );
        Ok(())
    }

    fn save_oauth_state(&self, record: &OAuthStateRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO oauth_states (state, provider, user_id, pkce_verifier, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                &record.state,
                record.provider.as_str(),
                &record.user_id,
                record.pkce_verifier.as_deref(),
                format_time(record.expires_at),
            ],
        )?;
        Ok(())
    }

    fn consume_oauth_state(
        &self,
        provider: Provider,
        state: &str,
        user_id: &str,
    ) -> Result<OAuthStateRecord> {
        let conn = self.conn()?;

        let consumed: Option<(String, Option<String>, String)> = conn
            .query_row(
                r#"
                DELETE FROM oauth_states
                WHERE state = ?1 AND provider = ?2 AND user_id = ?3
                RETURNING state, pkce_verifier, expires_at
                "#,
                params![state, provider.as_str(), user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match consumed {
            Some((state, pkce_verifier, expires_at)) => Ok(OAuthStateRecord {
                state,
                provider,
                user_id: user_id.to_string(),
                pkce_verifier,
                expires_at: parse_time("oauth_states.expires_at", &expires_at)?,
            }),
            None => Err(Self::diagnose_state(&conn, provider, state, user_id)?.into()),
        }
    }

    fn purge_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn()?.execute(
            "DELETE FROM oauth_states WHERE expires_at < ?1",
            params![format_time(now)],
        )?;
        if removed > 0 {
            tracing::debug!(removed, "Purged expired OAuth states");
        }
        Ok(removed)
    }

    fn upsert_change_item(&self, organization_id: &str, item: &ChangeItem) -> Result<()> {
        let labels = serde_json::to_string(&item.labels)?;
        let raw = serde_json::to_string(&item.raw)?;

        self.conn()?.execute(
            r#"
            INSERT INTO change_items (
                organization_id, provider, external_id, change_type, title, description,
                status, url, assignee, labels, created_at, updated_at, raw, cached_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT (organization_id, provider, external_id) DO UPDATE SET
                change_type = excluded.change_type,
                title = excluded.title,
                description = excluded.description,
                status = excluded.status,
                url = excluded.url,
                assignee = excluded.assignee,
                labels = excluded.labels,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                raw = excluded.raw,
                cached_at = excluded.cached_at
            "#,
            params![
                organization_id,
                item.provider.as_str(),
                &item.external_id,
                item.change_type.as_str(),
                &item.title,
                item.description.as_deref(),
                &item.status,
                item.url.as_deref(),
                item.assignee.as_deref(),
                labels,
                item.created_at.map(format_time),
                item.updated_at.map(format_time),
                raw,
                format_time(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn list_change_items(
        &self,
        organization_id: &str,
        provider: Option<Provider>,
    ) -> Result<Vec<ChangeItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT provider, external_id, change_type, title, description, status,
                   url, assignee, labels, created_at, updated_at, raw
            FROM change_items
            WHERE organization_id = ?1 AND (?2 IS NULL OR provider = ?2)
            ORDER BY COALESCE(updated_at, created_at, '') DESC, external_id
            "#,
        )?;

        let rows = stmt.query_map(
            params![organization_id, provider.map(|p| p.as_str())],
            |row| {
                Ok(ChangeItemRow {
                    provider: row.get(0)?,
                    external_id: row.get(1)?,
                    change_type: row.get(2)?,
                    title: row.get(3)?,
                    description: row.get(4)?,
                    status: row.get(5)?,
                    url: row.get(6)?,
                    assignee: row.get(7)?,
                    labels: row.get(8)?,
                    created_at: row.get(9)?,
                    updated_at: row.get(10)?,
                    raw: row.get(11)?,
                })
            },
        )?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.validate()?);
        }
        Ok(items)
    }
}

/// Untyped integration row as read from SQLite
struct IntegrationRow {
    organization_id: String,
    provider: String,
    encrypted_credentials: String,
    config: String,
    is_active: bool,
    updated_at: String,
}

impl IntegrationRow {
    fn validate(self) -> Result<IntegrationRecord> {
        if self.encrypted_credentials.trim().is_empty() {
            return Err(ChangeflowError::Validation(format!(
                "integration {}/{} has no credentials",
                self.organization_id, self.provider
            )));
        }

        let config: IntegrationConfig = serde_json::from_str(&self.config).map_err(|e| {
            ChangeflowError::Validation(format!("integrations.config is malformed: {}", e))
        })?;

        Ok(IntegrationRecord {
            provider: parse_provider(&self.provider)?,
            updated_at: parse_time("integrations.updated_at", &self.updated_at)?,
            organization_id: self.organization_id,
            encrypted_credentials: self.encrypted_credentials,
            config,
            is_active: self.is_active,
        })
    }
}

/// Untyped change item row as read from SQLite
struct ChangeItemRow {
    provider: String,
    external_id: String,
    change_type: String,
    title: String,
    description: Option<String>,
    status: String,
    url: Option<String>,
    assignee: Option<String>,
    labels: String,
    created_at: Option<String>,
    updated_at: Option<String>,
    raw: String,
}

impl ChangeItemRow {
    fn validate(self) -> Result<ChangeItem> {
        let change_type: ChangeType = self
            .change_type
            .parse()
            .map_err(ChangeflowError::Validation)?;
        let labels: Vec<String> = serde_json::from_str(&self.labels).map_err(|e| {
            ChangeflowError::Validation(format!("change_items.labels is malformed: {}", e))
        })?;
        let raw = serde_json::from_str(&self.raw).map_err(|e| {
            ChangeflowError::Validation(format!("change_items.raw is malformed: {}", e))
        })?;

        Ok(ChangeItem {
            provider: parse_provider(&self.provider)?,
            external_id: self.external_id,
            change_type,
            title: self.title,
            description: self.description,
            status: self.status,
            url: self.url,
            assignee: self.assignee,
            labels,
            created_at: self
                .created_at
                .as_deref()
                .map(|s| parse_time("change_items.created_at", s))
                .transpose()?,
            updated_at: self
                .updated_at
                .as_deref()
                .map(|s| parse_time("change_items.updated_at", s))
                .transpose()?,
            raw,
        })
    }
}

// Helper functions for type conversions

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ChangeflowError::Validation(format!("{} is not a timestamp: {}", field, e)))
}

fn parse_provider(value: &str) -> Result<Provider> {
    value.parse().map_err(ChangeflowError::Validation)
}
