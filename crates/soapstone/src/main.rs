//! Soapstone: inspect a Mastodon-compatible instance through the entity cache.
//!
//! Subcommands:
//! - `account`: fetch one account
//! - `relationships`: batched relationship lookup for several accounts
//! - `blocks`: page through the block list
//! - `notifications`: page through notifications, hiding duplicates

use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soapstone_cache::{EntityContext, HttpClient};

mod commands;

#[derive(Parser)]
#[command(name = "soapstone")]
#[command(about = "Inspect a Mastodon-compatible instance through the entity cache", long_about = None)]
struct Cli {
    /// Instance URL
    #[arg(long, global = true, env = "SOAPSTONE_INSTANCE_URL", default_value = "https://mastodon.social")]
    instance_url: String,

    /// OAuth access token. Required for blocks, relationships and notifications.
    #[arg(long, global = true, env = "SOAPSTONE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one account by id
    Account {
        /// Account id
        id: String,
    },

    /// Look up the relationship to each account in one request
    Relationships {
        /// Account ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List blocked accounts
    Blocks {
        /// Number of pages to fetch
        #[arg(long, default_value = "1")]
        pages: usize,
    },

    /// List notifications, collapsing duplicates
    Notifications {
        /// Number of pages to fetch
        #[arg(long, default_value = "1")]
        pages: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "soapstone=info,soapstone_cache=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let client = match &cli.access_token {
        Some(token) => HttpClient::new(&cli.instance_url).with_token(token),
        None => HttpClient::new(&cli.instance_url),
    };
    let ctx = EntityContext::new(Arc::new(client));

    if cli.access_token.is_some() {
        commands::sign_in(&ctx).await?;
    }

    match cli.command {
        Commands::Account { id } => commands::account(&ctx, &id).await,
        Commands::Relationships { ids } => commands::relationships(&ctx, &cli.instance_url, ids).await,
        Commands::Blocks { pages } => commands::blocks(&ctx, pages).await,
        Commands::Notifications { pages } => commands::notifications(&ctx, pages).await,
    }
}
