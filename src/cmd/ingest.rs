//! Stream ingestion: `runweave ingest`.

use anyhow::Result;
use runweave::config::Config;
use runweave::ingest::StreamIngestor;

use super::{open_broker, open_log, shutdown_token};

pub async fn cmd_ingest(config: &Config, consumer: Option<String>, once: bool) -> Result<()> {
    let ingest_config = config.toml.ingest_config(consumer);
    let ingestor = StreamIngestor::new(open_log(config)?, open_broker(config)?, ingest_config);
    tracing::info!(consumer = %ingestor.consumer(), once, "starting ingestor");

    let cancel = shutdown_token();
    let stats = if once {
        ingestor.run_once(cancel).await?
    } else {
        ingestor.run(cancel).await?
    };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
