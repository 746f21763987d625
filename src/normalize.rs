//! Change normalization
//!
//! Maps provider-native records onto [`ChangeItem`]. Normalization never
//! fails: a record whose shape cannot be read yields an item with empty or
//! `None` fields and the untouched `raw` payload, so the cache writer can
//! report it instead of losing it silently.

use crate::integrations::NativeRecord;
use crate::model::{ChangeItem, ChangeType, Provider};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Longest synthesized title, in characters
pub const MAX_TITLE_CHARS: usize = 200;

/// Length of the abbreviated commit hash used as a fallback title
const SHORT_SHA_LEN: usize = 7;

/// Normalize one native record
pub fn normalize(record: &NativeRecord) -> ChangeItem {
    match record {
        NativeRecord::GitHubCommit { repository, raw } => github_commit(repository, raw),
        NativeRecord::GitHubIssue { repository, raw } => github_issue(repository, raw),
        NativeRecord::JiraIssue { site_url, raw } => jira_issue(site_url, raw),
        NativeRecord::LinearIssue { raw } => linear_issue(raw),
    }
}

/// Normalize a page of records, preserving order
pub fn normalize_all(records: &[NativeRecord]) -> Vec<ChangeItem> {
    records.iter().map(normalize).collect()
}

/// Title from a commit message: its first line, trimmed and capped.
///
/// Falls back to `fallback` when the first line is blank.
pub fn synthesize_title(message: &str, fallback: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return fallback.to_string();
    }
    first_line.chars().take(MAX_TITLE_CHARS).collect()
}

/// Parse a provider timestamp.
///
/// Accepts RFC 3339 and Jira's `2024-01-15T10:30:00.000+0000` form.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value.and_then(parse_timestamp)
}

/// Deserialize leniently; an unreadable record becomes the empty default
fn lenient<T: DeserializeOwned + Default>(provider: Provider, raw: &Value) -> T {
    match serde_json::from_value(raw.clone()) {
        Ok(value) => value,
        Err(e) => {
            debug!(provider = %provider, error = %e, "Unreadable native record, keeping raw only");
            T::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Label names from either `["a"]` or `[{"name": "a"}]`
fn label_names(labels: &[Value]) -> Vec<String> {
    labels
        .iter()
        .filter_map(|label| match label {
            Value::String(name) => Some(name.clone()),
            Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect()
}

// ============ GitHub ============

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GitHubCommit {
    sha: String,
    html_url: Option<String>,
    commit: GitHubCommitDetail,
    author: Option<GitHubUser>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GitHubCommitDetail {
    message: String,
    author: Option<GitSignature>,
    committer: Option<GitSignature>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GitSignature {
    name: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GitHubUser {
    login: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GitHubIssue {
    number: Option<u64>,
    title: String,
    body: Option<String>,
    state: String,
    html_url: Option<String>,
    assignee: Option<GitHubUser>,
    labels: Vec<Value>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

fn github_commit(repository: &str, raw: &Value) -> ChangeItem {
    let commit: GitHubCommit = lenient(Provider::GitHub, raw);

    let external_id = if commit.sha.is_empty() {
        String::new()
    } else {
        format!("{}@{}", repository, commit.sha)
    };
    let short_sha: String = commit.sha.chars().take(SHORT_SHA_LEN).collect();

    // The body after the subject line, if any
    let description = commit
        .commit
        .message
        .split_once('\n')
        .map(|(_, rest)| rest.trim().to_string());

    let assignee = commit
        .author
        .and_then(|a| a.login)
        .or_else(|| commit.commit.author.as_ref().and_then(|s| s.name.clone()));

    ChangeItem {
        provider: Provider::GitHub,
        external_id,
        change_type: ChangeType::Commit,
        title: synthesize_title(&commit.commit.message, &short_sha),
        description: non_empty(description),
        status: "committed".to_string(),
        url: commit.html_url,
        assignee,
        labels: Vec::new(),
        created_at: timestamp(commit.commit.author.as_ref().and_then(|s| s.date.as_deref())),
        updated_at: timestamp(commit.commit.committer.as_ref().and_then(|s| s.date.as_deref())),
        raw: raw.clone(),
    }
}

fn github_issue(repository: &str, raw: &Value) -> ChangeItem {
    let issue: GitHubIssue = lenient(Provider::GitHub, raw);

    let external_id = issue
        .number
        .map(|n| format!("{}#{}", repository, n))
        .unwrap_or_default();
    let title = match issue.title.trim() {
        "" => external_id.clone(),
        title => title.to_string(),
    };

    ChangeItem {
        provider: Provider::GitHub,
        title,
        external_id,
        change_type: ChangeType::Issue,
        description: non_empty(issue.body),
        status: issue.state,
        url: issue.html_url,
        assignee: issue.assignee.and_then(|a| a.login),
        labels: label_names(&issue.labels),
        created_at: timestamp(issue.created_at.as_deref()),
        updated_at: timestamp(issue.updated_at.as_deref()),
        raw: raw.clone(),
    }
}

// ============ Jira ============

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JiraIssue {
    key: String,
    fields: JiraFields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JiraFields {
    summary: String,
    /// Plain text (API v2) or an Atlassian Document Format tree (v3)
    description: Value,
    status: Option<JiraNamed>,
    assignee: Option<JiraUser>,
    labels: Vec<Value>,
    created: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JiraNamed {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct JiraUser {
    display_name: Option<String>,
}

fn jira_issue(site_url: &str, raw: &Value) -> ChangeItem {
    let issue: JiraIssue = lenient(Provider::Jira, raw);
    let fields = issue.fields;

    let url = (!issue.key.is_empty() && !site_url.is_empty())
        .then(|| format!("{}/browse/{}", site_url.trim_end_matches('/'), issue.key));
    let title = match fields.summary.trim() {
        "" => issue.key.clone(),
        summary => summary.to_string(),
    };

    ChangeItem {
        provider: Provider::Jira,
        external_id: issue.key,
        change_type: ChangeType::Ticket,
        title,
        description: non_empty(description_text(&fields.description)),
        status: fields.status.map(|s| s.name).unwrap_or_default(),
        url,
        assignee: fields.assignee.and_then(|a| a.display_name),
        labels: label_names(&fields.labels),
        created_at: timestamp(fields.created.as_deref()),
        updated_at: timestamp(fields.updated.as_deref()),
        raw: raw.clone(),
    }
}

fn description_text(description: &Value) -> Option<String> {
    match description {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(_) => Some(adf_to_text(description)),
        _ => None,
    }
}

/// Flatten an Atlassian Document Format tree to plain text
pub fn adf_to_text(node: &Value) -> String {
    let mut out = String::new();
    push_adf(node, &mut out);
    out.trim().to_string()
}

fn push_adf(node: &Value, out: &mut String) {
    match node.get("type").and_then(Value::as_str) {
        Some("text") => {
            if let Some(text) = node.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
        Some("hardBreak") => out.push('\n'),
        Some("mention") | Some("emoji") => {
            if let Some(text) = node.pointer("/attrs/text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
        kind => {
            if let Some(children) = node.get("content").and_then(Value::as_array) {
                for child in children {
                    push_adf(child, out);
                }
            }
            let is_block = matches!(
                kind,
                Some("paragraph")
                    | Some("heading")
                    | Some("codeBlock")
                    | Some("blockquote")
                    | Some("listItem")
                    | Some("rule")
            );
            if is_block && !out.ends_with('\n') {
                out.push('\n');
            }
        }
    }
}

// ============ Linear ============

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LinearIssue {
    identifier: String,
    title: String,
    description: Option<String>,
    url: Option<String>,
    state: Option<LinearNamed>,
    assignee: Option<LinearNamed>,
    labels: Option<LinearLabels>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LinearNamed {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LinearLabels {
    nodes: Vec<Value>,
}

fn linear_issue(raw: &Value) -> ChangeItem {
    let issue: LinearIssue = lenient(Provider::Linear, raw);

    let title = match issue.title.trim() {
        "" => issue.identifier.clone(),
        title => title.to_string(),
    };

    ChangeItem {
        provider: Provider::Linear,
        external_id: issue.identifier,
        change_type: ChangeType::Issue,
        title,
        description: non_empty(issue.description),
        status: issue.state.map(|s| s.name).unwrap_or_default(),
        url: issue.url,
        assignee: non_empty(issue.assignee.map(|a| a.name)),
        labels: issue
            .labels
            .map(|l| label_names(&l.nodes))
            .unwrap_or_default(),
        created_at: timestamp(issue.created_at.as_deref()),
        updated_at: timestamp(issue.updated_at.as_deref()),
        raw: raw.clone(),
    }
}
