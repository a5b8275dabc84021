//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `project`       | `Init`                                             |
//! | `ingest`        | `Ingest`                                           |
//! | `queue`         | `QueueWorker`, `Queue`                             |
//! | `run`           | `Run`, `Emit`                                      |
//! | `token`         | `Token`                                            |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod ingest;
pub mod project;
pub mod queue;
pub mod run;
pub mod token;

pub use config::cmd_config;
pub use ingest::cmd_ingest;
pub use project::cmd_init;
pub use queue::{cmd_queue_usage, cmd_queue_worker};
pub use run::{cmd_emit, cmd_run};
pub use token::cmd_token;

use anyhow::Result;
use runweave::broker::Broker;
use runweave::config::Config;
use runweave::eventlog::EventLog;
use tokio_util::sync::CancellationToken;

pub(crate) fn open_log(config: &Config) -> Result<EventLog> {
    EventLog::open(&config.events_path(), config.toml.run_timeout()?)
}

pub(crate) fn open_broker(config: &Config) -> Result<Broker> {
    Broker::open(&config.broker_path())
}

/// A token cancelled on Ctrl-C.
pub(crate) fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received; shutting down");
                trip.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "failed to listen for Ctrl-C"),
        }
    });
    token
}
