//! LLM request queue commands: `runweave queue-worker`, `runweave queue usage`.

use anyhow::Result;
use runweave::config::Config;
use runweave::queue::{HttpCompletionClient, QueueWorker, RateLimitedQueue};

use super::{open_broker, shutdown_token};

pub async fn cmd_queue_worker(config: &Config) -> Result<()> {
    let queue = &config.toml.queue;
    let api_key = std::env::var(&queue.api_key_env).ok();
    if api_key.is_none() {
        tracing::warn!(env = %queue.api_key_env, "no API key set; requests go out unauthenticated");
    }
    let client = HttpCompletionClient::new(queue.endpoint.clone(), api_key);
    let worker = QueueWorker::new(open_broker(config)?, client, config.toml.queue_config());
    worker.run(shutdown_token()).await;
    Ok(())
}

pub async fn cmd_queue_usage(config: &Config) -> Result<()> {
    let queue = RateLimitedQueue::new(open_broker(config)?, config.toml.queue_config());
    let usage = queue.usage().await?;
    println!("{}", serde_json::to_string_pretty(&usage)?);
    Ok(())
}
