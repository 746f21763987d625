//! Changeflow - change ingestion across GitHub, Jira and Linear
//!
//! Main entry point for the Changeflow CLI.

use anyhow::{bail, Context};
use changeflow::config::{validate_config, ChangeflowConfig};
use changeflow::ingest::{IngestEngine, SyncRequest, DEFAULT_MAX_PAGES};
use changeflow::integrations::{ChangeQuery, PageRequest, MAX_PAGE_SIZE};
use changeflow::oauth::CallbackParams;
use changeflow::vault::CredentialVault;
use changeflow::{ChangeItem, ChangeType, ChangeflowError, Provider};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

/// Changeflow - pull commits, issues and tickets into one cache
#[derive(Parser, Debug)]
#[command(name = "changeflow")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/changeflow/config.yaml)
    #[arg(short, long, global = true, env = "CHANGEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log at info level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a base64 AES-256 key for the credential vault
    Keygen,

    /// Check the configuration and report every problem found
    Validate,

    /// Start an OAuth flow and print the authorization URL
    Authorize {
        /// github, jira or linear
        provider: Provider,

        /// User starting the flow; the callback must come from the same user
        #[arg(short, long)]
        user: String,
    },

    /// Complete an OAuth flow with the callback parameters
    Callback {
        provider: Provider,

        #[arg(short, long)]
        org: String,

        #[arg(short, long)]
        user: String,

        #[arg(long)]
        state: String,

        #[arg(long)]
        code: Option<String>,

        /// `error` parameter returned instead of a code
        #[arg(long)]
        error: Option<String>,
    },

    /// List repositories, projects or teams visible to the integration
    Projects {
        provider: Provider,

        #[arg(short, long)]
        org: String,

        #[arg(long, default_value_t = MAX_PAGE_SIZE)]
        per_page: u32,
    },

    /// Fetch one page of changes without caching them
    Fetch {
        provider: Provider,

        #[arg(short, long)]
        org: String,

        /// commit, issue or ticket
        #[arg(short = 't', long = "type")]
        change_type: ChangeType,

        /// Repository (owner/name), Jira project key or Linear team key
        #[arg(short, long)]
        scope: Option<String>,

        /// Only changes updated at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// Fetch changes and upsert them into the cache
    Sync {
        provider: Provider,

        #[arg(short, long)]
        org: String,

        #[arg(short = 't', long = "type")]
        change_type: ChangeType,

        #[arg(short, long)]
        scope: Option<String>,

        #[arg(long)]
        since: Option<DateTime<Utc>>,

        #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
        max_pages: u32,
    },

    /// Show cached change items
    Items {
        #[arg(short, long)]
        org: String,

        #[arg(short, long)]
        provider: Option<Provider>,

        /// Print items as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show whether the stored access token is active, expiring or expired
    Status {
        provider: Provider,

        #[arg(short, long)]
        org: String,
    },

    /// Mark an integration inactive
    Disconnect {
        provider: Provider,

        #[arg(short, long)]
        org: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    if let Err(e) = changeflow::logging::init_with_level(level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ChangeflowConfig> {
    let config = match path {
        Some(path) => ChangeflowConfig::load(path)?,
        None => match ChangeflowConfig::load_default() {
            Ok(config) => config,
            Err(ChangeflowError::Config(msg)) if msg.contains("Config file not found") => {
                bail!(
                    "No configuration found at {}.\n\n\
                     Create it with at least:\n  \
                     providers:\n    \
                     github:\n      \
                     client_id: ...\n      \
                     client_secret: $GITHUB_CLIENT_SECRET",
                    ChangeflowConfig::default_path().display()
                );
            }
            Err(e) => return Err(e.into()),
        },
    };
    tracing::info!(providers = ?config.configured_providers(), "Configuration loaded");
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Keygen => {
            println!("{}", CredentialVault::generate_key()?);
            Ok(())
        }
        Commands::Validate => {
            let config = load_config(cli.config.as_ref())?;
            match validate_config(&config) {
                Ok(()) => {
                    println!("Configuration OK ({} providers)", config.configured_providers().len());
                    Ok(())
                }
                Err(errors) => {
                    for error in &errors {
                        println!("  ✗ {}", error);
                    }
                    bail!("{} configuration problem(s)", errors.len())
                }
            }
        }
        command => {
            let config = load_config(cli.config.as_ref())?;
            let engine =
                IngestEngine::from_config(config).context("Failed to start the ingestion engine")?;

            let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
            runtime.block_on(execute(&engine, command))
        }
    }
}

async fn execute(engine: &IngestEngine, command: Commands) -> anyhow::Result<()> {
    match command {
        // Handled in run() without an engine
        Commands::Keygen | Commands::Validate => {}

        Commands::Authorize { provider, user } => {
            let request = engine.oauth().begin_authorization(provider, &user)?;
            println!("Open this URL to connect {}:", provider);
            println!();
            println!("  {}", request.url);
            println!();
            println!("State: {} (expires {})", request.state, request.expires_at.to_rfc3339());
        }

        Commands::Callback {
            provider,
            org,
            user,
            state,
            code,
            error,
        } => {
            let params = CallbackParams {
                code,
                state,
                error,
                error_description: None,
            };
            let record = engine
                .oauth()
                .complete_authorization(provider, &org, &user, params)
                .await?;

            println!("✓ Connected {} for {}", provider, record.organization_id);
            if !record.config.scopes.is_empty() {
                println!("  Scopes: {}", record.config.scopes.join(", "));
            }
            for site in &record.config.resources {
                let marker = if record.config.preferred_resource_id.as_deref() == Some(site.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("  {} {} ({})", marker, site.name, site.url);
            }
        }

        Commands::Projects { provider, org, per_page } => {
            let mut page = PageRequest::first(per_page);
            loop {
                let result = engine.list_projects(&org, provider, &page).await?;
                for project in &result.items {
                    println!("{:<30} {}", project.key, project.name);
                }
                match result.next {
                    Some(cursor) => page = PageRequest::at(cursor, per_page),
                    None => break,
                }
            }
        }

        Commands::Fetch {
            provider,
            org,
            change_type,
            scope,
            since,
        } => {
            let mut query = ChangeQuery::new(change_type);
            query.scope = scope;
            query.since = since;

            let page = engine.fetch(&org, provider, &query).await?;
            print_items(&page.items);
            if let Some(next) = page.next {
                println!();
                println!("More available: {:?}", next);
            }
        }

        Commands::Sync {
            provider,
            org,
            change_type,
            scope,
            since,
            max_pages,
        } => {
            let mut request = SyncRequest::new(provider, change_type);
            request.scope = scope;
            request.since = since;
            request.max_pages = max_pages;

            let report = engine.sync(&org, &request).await?;
            println!(
                "Synced {} {} item(s) from {} in {} page(s)",
                report.upsert.written, change_type, provider, report.pages
            );
            if report.truncated {
                println!("  Page limit reached; run again with a higher --max-pages for the rest");
            }
            for (external_id, error) in &report.upsert.failures {
                println!("  ✗ {}: {}", if external_id.is_empty() { "<no id>" } else { external_id }, error);
            }
        }

        Commands::Items { org, provider, json } => {
            let items = engine.cache().items(&org, provider)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                println!("{} cached item(s)", items.len());
                println!();
                print_items(&items);
            }
        }

        Commands::Status { provider, org } => {
            let status = engine.oauth().token_status(&org, provider)?;
            println!("{} for {}: {:?}", provider, org, status);
        }

        Commands::Disconnect { provider, org } => {
            engine.oauth().disconnect(&org, provider)?;
            println!("✓ Disconnected {} for {}", provider, org);
        }
    }

    Ok(())
}

fn print_items(items: &[ChangeItem]) {
    for item in items {
        let updated = item
            .updated_at
            .or(item.created_at)
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<24} {:<12} {:<10} {}",
            item.provider.as_str(),
            item.external_id,
            item.status,
            updated,
            item.title
        );
    }
}
