//! Credential refresh through the singleton lock: `runweave token`.

use anyhow::{Context, Result};
use runweave::config::Config;
use runweave::lock::{OAuthRefresher, RefreshLock};

use super::open_broker;

pub async fn cmd_token(
    config: &Config,
    subject: &str,
    seed_refresh_token: Option<&str>,
    force: bool,
) -> Result<()> {
    let section = &config.toml.lock;
    let client_id = std::env::var(&section.client_id_env)
        .with_context(|| format!("{} is not set", section.client_id_env))?;
    let client_secret = std::env::var(&section.client_secret_env)
        .with_context(|| format!("{} is not set", section.client_secret_env))?;

    let broker = open_broker(config)?;
    let refresher = OAuthRefresher::new(
        broker.clone(),
        section.namespace.clone(),
        section.token_url.clone(),
        client_id,
        client_secret,
    );
    if let Some(token) = seed_refresh_token {
        refresher.store_refresh_token(subject, token).await?;
    }

    let lock = RefreshLock::new(broker, config.toml.lock_config());
    if force {
        lock.invalidate(subject).await?;
    }
    let credential = lock.credential(subject, &refresher).await?;
    println!("{}", serde_json::to_string_pretty(&credential)?);
    Ok(())
}
