//! Linear Integration Adapter
//!
//! Linear exposes a single GraphQL endpoint. Teams stand in for projects;
//! issues page with Relay-style `first`/`after` cursors.

use super::{unsupported, ChangeQuery, NativeRecord, Page, PageCursor, PageRequest, Project, ProviderAdapter};
use crate::model::{ChangeType, Provider};
use crate::oauth::AccessToken;
use crate::transport::Gateway;
use crate::{ChangeflowError, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const TEAMS_QUERY: &str = r#"
query Teams($first: Int!, $after: String) {
  teams(first: $first, after: $after) {
    nodes { id key name }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const ISSUES_QUERY: &str = r#"
query Issues($first: Int!, $after: String, $filter: IssueFilter) {
  issues(first: $first, after: $after, filter: $filter, orderBy: updatedAt) {
    nodes {
      id
      identifier
      title
      description
      url
      createdAt
      updatedAt
      state { name type }
      assignee { name email }
      labels { nodes { name } }
      team { key }
    }
    pageInfo { hasNextPage endCursor }
  }
}"#;

/// Linear GraphQL client
pub struct LinearAdapter {
    gateway: Gateway,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    extensions: Option<Value>,
}

impl GraphQlError {
    fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

impl PageInfo {
    fn next(self) -> Option<PageCursor> {
        match (self.has_next_page, self.end_cursor) {
            (true, Some(cursor)) => Some(PageCursor::After(cursor)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    nodes: Vec<T>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct TeamsData {
    teams: Connection<LinearTeam>,
}

#[derive(Debug, Deserialize)]
struct LinearTeam {
    id: String,
    key: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct IssuesData {
    issues: Connection<Value>,
}

impl LinearAdapter {
    pub fn new(gateway: Gateway, base_url: impl Into<String>) -> Self {
        Self {
            gateway,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn after(page: &PageRequest) -> Result<Option<String>> {
        match &page.cursor {
            None => Ok(None),
            Some(PageCursor::After(cursor)) => Ok(Some(cursor.clone())),
            Some(other) => Err(ChangeflowError::InvalidRequest(format!(
                "Linear paginates by cursor, got {:?}",
                other
            ))),
        }
    }

    /// Issue filter for a team key and update floor
    fn issue_filter(query: &ChangeQuery) -> Value {
        let mut filter = serde_json::Map::new();
        if let Some(team) = &query.scope {
            filter.insert("team".to_string(), json!({ "key": { "eq": team } }));
        }
        if let Some(since) = query.since {
            filter.insert(
                "updatedAt".to_string(),
                json!({ "gte": since.to_rfc3339_opts(SecondsFormat::Millis, true) }),
            );
        }
        Value::Object(filter)
    }

    /// Run one GraphQL operation.
    ///
    /// Linear reports authentication failures as GraphQL errors, sometimes
    /// with HTTP 400; those become [`ChangeflowError::AuthExpired`].
    async fn graphql<T: DeserializeOwned>(
        &self,
        token: &AccessToken,
        query: &str,
        variables: Value,
    ) -> Result<T> {
        let request = self
            .gateway
            .client()
            .post(format!("{}/graphql", self.base_url))
            .bearer_auth(token.secret())
            .header(header::ACCEPT, "application/json")
            .json(&json!({ "query": query, "variables": variables }))
            .build()?;

        let response = self.gateway.send(Provider::Linear, request).await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ChangeflowError::AuthExpired(Provider::Linear));
        }

        let parsed: Option<GraphQlResponse<T>> = response.json().ok();

        if let Some(errors) = parsed.as_ref().map(|p| &p.errors) {
            if errors
                .iter()
                .any(|e| e.code() == Some("AUTHENTICATION_ERROR"))
            {
                return Err(ChangeflowError::AuthExpired(Provider::Linear));
            }
        }

        match parsed {
            Some(GraphQlResponse {
                data: Some(data),
                errors,
            }) if status.is_success() && errors.is_empty() => Ok(data),
            Some(GraphQlResponse { errors, .. }) if !errors.is_empty() => {
                let message = errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(status = status.as_u16(), error = %message, "Linear GraphQL error");
                Err(ChangeflowError::Upstream {
                    provider: Provider::Linear,
                    status: status.as_u16(),
                    message,
                })
            }
            _ => Err(ChangeflowError::Upstream {
                provider: Provider::Linear,
                status: status.as_u16(),
                message: response.text().chars().take(500).collect(),
            }),
        }
    }

    /// One page of issues, most recently updated first
    pub async fn list_issues(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>> {
        let after = Self::after(&query.page)?;
        let first = query.page.limit();

        debug!(team = ?query.scope, first, "Listing Linear issues");

        let data: IssuesData = self
            .graphql(
                token,
                ISSUES_QUERY,
                json!({
                    "first": first,
                    "after": after,
                    "filter": Self::issue_filter(query),
                }),
            )
            .await?;

        info!(returned = data.issues.nodes.len(), "Linear issues fetched");

        Ok(Page {
            items: data
                .issues
                .nodes
                .into_iter()
                .map(|raw| NativeRecord::LinearIssue { raw })
                .collect(),
            next: data.issues.page_info.next(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for LinearAdapter {
    fn provider(&self) -> Provider {
        Provider::Linear
    }

    fn change_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Issue, ChangeType::Ticket]
    }

    async fn list_projects(&self, token: &AccessToken, page: &PageRequest) -> Result<Page<Project>> {
        let data: TeamsData = self
            .graphql(
                token,
                TEAMS_QUERY,
                json!({ "first": page.limit(), "after": Self::after(page)? }),
            )
            .await?;

        Ok(Page {
            items: data
                .teams
                .nodes
                .into_iter()
                .map(|team| Project {
                    id: team.id,
                    key: team.key,
                    name: team.name,
                    url: None,
                })
                .collect(),
            next: data.teams.page_info.next(),
        })
    }

    async fn list_changes(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>> {
        match query.change_type {
            ChangeType::Issue | ChangeType::Ticket => self.list_issues(token, query).await,
            other => Err(unsupported(Provider::Linear, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::ProviderLimiter;
    use crate::model::IntegrationConfig;
    use crate::transport::{RetryPolicy, Transport};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> LinearAdapter {
        let gateway = Gateway::new(
            Transport::new().unwrap(),
            Arc::new(ProviderLimiter::default()),
            RetryPolicy::quick(),
        );
        LinearAdapter::new(gateway, server.uri())
    }

    fn token() -> AccessToken {
        AccessToken::new(Provider::Linear, "org-1", "lin_token", IntegrationConfig::default())
    }

    #[test]
    fn test_issue_filter() {
        let query = ChangeQuery::new(ChangeType::Issue)
            .scope("ENG")
            .since(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(
            LinearAdapter::issue_filter(&query),
            json!({
                "team": {"key": {"eq": "ENG"}},
                "updatedAt": {"gte": "2024-01-02T03:04:05.000Z"}
            })
        );
        assert_eq!(
            LinearAdapter::issue_filter(&ChangeQuery::new(ChangeType::Issue)),
            json!({})
        );
    }

    #[tokio::test]
    async fn test_list_issues_with_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(header_eq("authorization", "Bearer lin_token"))
            .and(body_partial_json(json!({
                "variables": {"first": 25, "after": "cursor-1", "filter": {"team": {"key": {"eq": "ENG"}}}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"issues": {
                    "nodes": [{"id": "i1", "identifier": "ENG-1", "title": "First"}],
                    "pageInfo": {"hasNextPage": true, "endCursor": "cursor-2"}
                }}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let query = ChangeQuery::new(ChangeType::Issue)
            .scope("ENG")
            .page(PageRequest::at(PageCursor::After("cursor-1".to_string()), 25));
        let page = adapter(&server).list_changes(&token(), &query).await.unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].raw()["identifier"], "ENG-1");
        assert_eq!(page.next, Some(PageCursor::After("cursor-2".to_string())));
    }

    #[tokio::test]
    async fn test_last_page_has_no_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"teams": {
                    "nodes": [{"id": "t1", "key": "ENG", "name": "Engineering"}],
                    "pageInfo": {"hasNextPage": false, "endCursor": "x"}
                }}
            })))
            .mount(&server)
            .await;

        let page = adapter(&server)
            .list_projects(&token(), &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.items[0].key, "ENG");
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_authentication_error_in_graphql_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errors": [{
                    "message": "Authentication required, not authenticated",
                    "extensions": {"code": "AUTHENTICATION_ERROR"}
                }]
            })))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .list_changes(&token(), &ChangeQuery::new(ChangeType::Issue))
            .await;
        assert!(matches!(result, Err(ChangeflowError::AuthExpired(Provider::Linear))));
    }

    #[tokio::test]
    async fn test_other_graphql_errors_are_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{"message": "Field 'foo' doesn't exist"}]
            })))
            .mount(&server)
            .await;

        match adapter(&server)
            .list_changes(&token(), &ChangeQuery::new(ChangeType::Issue))
            .await
        {
            Err(ChangeflowError::Upstream { status, message, .. }) => {
                assert_eq!(status, 200);
                assert!(message.contains("foo"));
            }
            other => panic!("unexpected result {:?}", other.map(|p| p.items.len())),
        }
    }

    #[tokio::test]
    async fn test_http_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .list_changes(&token(), &ChangeQuery::new(ChangeType::Issue))
            .await;
        assert!(matches!(result, Err(ChangeflowError::AuthExpired(Provider::Linear))));
        assert!(adapter(&server)
            .list_changes(&token(), &ChangeQuery::new(ChangeType::Commit))
            .await
            .is_err());
    }
}
