//! Subcommand implementations.

use std::sync::Arc;

use miette::{IntoDiagnostic, Result};
use reqwest::Url;
use serde_json::Value;
use tracing::{info, warn};

use soapstone_cache::{
    Account, CacheError, Entity, EntityContext, EntityId, EntityKind, ListKey, Relationship, Transport,
    UseBatchedOpts, UseEntitiesOpts, UseEntityOpts,
};

const NOTIFICATIONS: &str = "/api/v1/notifications";

/// Bind the session to the token's account.
pub async fn sign_in(ctx: &EntityContext) -> Result<()> {
    let response = ctx
        .transport()
        .get("/api/v1/accounts/verify_credentials")
        .await
        .map_err(|e| miette::miette!("failed to verify credentials: {}", e))?;
    let me = Entity::from_value(response.body).map_err(|e| miette::miette!("{}", e))?;

    ctx.switch_account(me.id());
    let id = me.id().to_string();
    ctx.cache().import_entities(vec![me], EntityKind::Accounts, None);
    if let Some(account) = ctx.cache().get_as::<Account>(&id) {
        info!(account = %account.acct, "signed in");
    }
    Ok(())
}

pub async fn account(ctx: &EntityContext, id: &str) -> Result<()> {
    let query = ctx.use_entity::<Account>(id, format!("/api/v1/accounts/{}", id), UseEntityOpts::default());
    let account = query
        .mount()
        .await
        .map_err(|e| miette::miette!("{}", e))?
        .ok_or_else(|| miette::miette!("account {} not found", id))?;

    println!("@{} ({})", account.acct, account.id);
    if !account.display_name.is_empty() {
        println!("  name:      {}", account.display_name);
    }
    println!("  followers: {}", account.followers_count);
    Ok(())
}

pub async fn relationships(ctx: &EntityContext, instance_url: &str, ids: Vec<String>) -> Result<()> {
    let base = Url::parse(instance_url)
        .and_then(|url| url.join("/api/v1/accounts/relationships"))
        .into_diagnostic()?;
    let transport = Arc::clone(ctx.transport());
    let fetch_many = move |ids: Vec<EntityId>| {
        let transport = Arc::clone(&transport);
        let url = relationships_url(&base, &ids);
        async move {
            let (items, _) = transport.get(url.as_str()).await?.into_page()?;
            Ok::<Vec<Value>, CacheError>(items)
        }
    };

    let query = ctx.use_batched_entities::<Relationship, _, _, _, _>(
        ListKey::new(EntityKind::Relationships, ["cli"]),
        ids,
        fetch_many,
        UseBatchedOpts::default(),
    );
    let found = query.mount().await.map_err(|e| miette::miette!("{}", e))?;

    for id in query.ids() {
        match found.get(id) {
            Some(r) => println!(
                "{:>20}  following={} followed_by={} blocking={} muting={}",
                id, r.following, r.followed_by, r.blocking, r.muting
            ),
            None => println!("{:>20}  (no relationship returned)", id),
        }
    }
    Ok(())
}

/// `base` with one percent-encoded `id[]` pair per id.
fn relationships_url(base: &Url, ids: &[EntityId]) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .extend_pairs(ids.iter().map(|id| ("id[]", id.as_str())));
    url
}

pub async fn blocks(ctx: &EntityContext, pages: usize) -> Result<()> {
    let query = ctx.use_entities::<Account>(
        ListKey::new(EntityKind::Accounts, ["blocks"]),
        "/api/v1/blocks",
        UseEntitiesOpts::default(),
    );
    query.mount().await.map_err(|e| miette::miette!("{}", e))?;

    for _ in 1..pages {
        if !query.fetch_next_page().await.map_err(|e| miette::miette!("{}", e))? {
            break;
        }
    }

    let blocked = query.entities();
    for account in &blocked {
        println!("@{}", account.acct);
    }
    println!(
        "{} blocked account(s){}",
        blocked.len(),
        if query.has_next_page() { ", more available" } else { "" }
    );
    Ok(())
}

pub async fn notifications(ctx: &EntityContext, pages: usize) -> Result<()> {
    let feed = ctx.use_notifications(ListKey::new(EntityKind::Notifications, ["all"]), NOTIFICATIONS);
    feed.fetch_notifications()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    for _ in 1..pages {
        match feed.fetch_next_page().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(CacheError::RateLimited { retry_after_secs, .. }) => {
                warn!(?retry_after_secs, "rate limited, stopping early");
                break;
            }
            Err(e) => return Err(miette::miette!("{}", e)),
        }
    }

    let visible = feed.notifications();
    for n in &visible {
        let acct = ctx
            .cache()
            .get_as::<Account>(&n.account_id)
            .map_or_else(|| n.account_id.clone(), |a| a.acct);
        println!(
            "{}  {:<24} @{}{}",
            n.created_at.format("%Y-%m-%d %H:%M"),
            n.kind.as_str(),
            acct,
            n.target_id.as_deref().map(|t| format!(" → {}", t)).unwrap_or_default()
        );
    }

    let total = ctx
        .cache()
        .list(feed.list_key())
        .map_or(0, |list| list.len());
    println!(
        "{} notification(s), {} duplicate(s) hidden",
        visible.len(),
        total.saturating_sub(visible.len())
    );
    Ok(())
}
