//! Kafka consumer binary.
//!
//! Exits with status 0 after an orderly shutdown and 1 on any bootstrap failure.

use kafka_consumer_service::bootstrap::{Application, BootstrapError, init_tracing};
use kafka_consumer_service::config::Config;
use std::process::ExitCode;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be initialised yet.
            tracing::error!(error = %e, "Bootstrap failed");
            eprintln!("kafka-consumer: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BootstrapError> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level)?;

    info!(
        brokers = ?config.kafka.brokers,
        topics = ?config.kafka.topics,
        group_id = %config.kafka.group_id,
        database = %config.database.redacted_url(),
        "Configuration loaded"
    );

    Application::build(config).await?.run().await
}
