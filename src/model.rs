//! Core data model
//!
//! Provider identity, the canonical [`ChangeItem`], and the records the engine
//! keeps in the external store: one-time OAuth state and per-organization
//! integrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the external services the engine ingests from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    Jira,
    Linear,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::GitHub, Provider::Jira, Provider::Linear];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::Jira => "jira",
            Provider::Linear => "linear",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(Provider::GitHub),
            "jira" => Ok(Provider::Jira),
            "linear" => Ok(Provider::Linear),
            other => Err(format!(
                "Unknown provider '{}'. Must be one of: github, jira, linear",
                other
            )),
        }
    }
}

/// Kind of activity a change item represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Commit,
    Issue,
    Ticket,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Commit => "commit",
            ChangeType::Issue => "issue",
            ChangeType::Ticket => "ticket",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "commit" => Ok(ChangeType::Commit),
            "issue" => Ok(ChangeType::Issue),
            "ticket" => Ok(ChangeType::Ticket),
            other => Err(format!(
                "Unknown change type '{}'. Must be one of: commit, issue, ticket",
                other
            )),
        }
    }
}

/// Canonical, provider-agnostic unit of activity.
///
/// Optional fields serialize as `null` rather than being omitted so that
/// downstream consumers always see the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeItem {
    pub provider: Provider,
    pub external_id: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub url: Option<String>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

/// Transient, single-use record binding an authorization redirect to its initiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthStateRecord {
    pub state: String,
    pub provider: Provider,
    pub user_id: String,
    pub pkce_verifier: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthStateRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A site or workspace the granted token can reach (Jira cloud sites)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibleResource {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Provider-specific integration metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Scopes granted at the last token exchange or refresh
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Reachable sites (Jira); empty for other providers
    #[serde(default)]
    pub resources: Vec<AccessibleResource>,

    /// Site used for API calls when several are reachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_resource_id: Option<String>,
}

impl IntegrationConfig {
    /// The preferred site, falling back to the first reachable one
    pub fn preferred_resource(&self) -> Option<&AccessibleResource> {
        self.preferred_resource_id
            .as_ref()
            .and_then(|id| self.resources.iter().find(|r| &r.id == id))
            .or_else(|| self.resources.first())
    }
}

/// Durable per-organization connection to one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationRecord {
    pub organization_id: String,
    pub provider: Provider,
    /// Vault ciphertext; only the vault may decrypt it
    pub encrypted_credentials: String,
    pub config: IntegrationConfig,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_provider_round_trip_names() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert_eq!("GitHub".parse::<Provider>().unwrap(), Provider::GitHub);
        assert!("gitlab".parse::<Provider>().is_err());
    }

    #[test]
    fn test_change_item_serializes_nulls() {
        let item = ChangeItem {
            provider: Provider::Linear,
            external_id: "ENG-1".to_string(),
            change_type: ChangeType::Ticket,
            title: "Ship it".to_string(),
            description: None,
            status: "Todo".to_string(),
            url: None,
            assignee: None,
            labels: vec![],
            created_at: None,
            updated_at: None,
            raw: serde_json::json!({}),
        };

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["provider"], "linear");
        assert_eq!(json["type"], "ticket");
        assert_eq!(json["externalId"], "ENG-1");
        assert!(json.get("description").unwrap().is_null());
        assert!(json.get("assignee").unwrap().is_null());
        assert_eq!(json["labels"], serde_json::json!([]));
    }

    #[test]
    fn test_state_expiry() {
        let now = Utc::now();
        let record = OAuthStateRecord {
            state: "abc".to_string(),
            provider: Provider::GitHub,
            user_id: "user-1".to_string(),
            pkce_verifier: None,
            expires_at: now,
        };
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn test_preferred_resource_fallback() {
        let site = |id: &str| AccessibleResource {
            id: id.to_string(),
            name: id.to_string(),
            url: format!("https://{}.atlassian.net", id),
            scopes: vec![],
        };
        let mut config = IntegrationConfig {
            scopes: vec![],
            resources: vec![site("a"), site("b")],
            preferred_resource_id: None,
        };
        assert_eq!(config.preferred_resource().unwrap().id, "a");

        config.preferred_resource_id = Some("b".to_string());
        assert_eq!(config.preferred_resource().unwrap().id, "b");

        config.preferred_resource_id = Some("gone".to_string());
        assert_eq!(config.preferred_resource().unwrap().id, "a");
    }
}
