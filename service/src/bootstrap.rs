//! Process bootstrap and run loop.
//!
//! Bootstrap order:
//!
//! 1. Configuration (done by the caller, see [`crate::config::Config::from_env`])
//! 2. Logging ([`init_tracing`])
//! 3. Metrics exporter, when configured
//! 4. Database connection and migrations
//! 5. Repository, handler and broker client ([`Application::build`])
//! 6. Non-blocking consumer start, then signal handling ([`Application::run`])
//!
//! Any failure up to and including signal installation is a bootstrap error
//! and ends the process with a non-zero exit code. After that, the process
//! exits cleanly once the consumer has drained, even if the grace period ran
//! out.

use crate::config::{Config, ConfigError};
use crate::foo::PostgresFooRepository;
use crate::handler::FooHandler;
use futures::Stream;
use kafka_consumer_core::{CancelCause, CancellationContext, MessageHandler, ShutdownSignal};
use kafka_consumer_postgres::{DatabaseError, connect, migrate};
use kafka_consumer_redpanda::RedpandaBroker;
use kafka_consumer_runtime::metrics::{MetricsError, install_exporter};
use kafka_consumer_runtime::{
    Consumer, ConsumerError, ConsumerHandle, ConsumerReport, ShutdownCoordinator, ShutdownError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Bootstrap-phase errors.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The tracing subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// The metrics exporter could not be installed
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Database connection or migration failed
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The consumer could not start
    #[error("Consumer start failed: {0}")]
    Consumer(#[from] ConsumerError),

    /// Signal handlers could not be installed
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `level` is used as the filter.
///
/// # Errors
///
/// Returns [`BootstrapError::Logging`] if the filter is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(level: &str) -> Result<(), BootstrapError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| BootstrapError::Logging(format!("invalid log filter '{level}': {e}")))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| BootstrapError::Logging(e.to_string()))
}

/// A fully wired consumer service.
pub struct Application {
    config: Config,
    consumer: Consumer,
    handler: Arc<dyn MessageHandler>,
}

impl Application {
    /// Connect to the database, run migrations and wire the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the metrics exporter, the database
    /// connection or a migration fails.
    pub async fn build(config: Config) -> Result<Self, BootstrapError> {
        if let Some(addr) = config.metrics_addr {
            install_exporter(addr)?;
        }

        let pool = connect(&config.database).await?;
        migrate(&pool, &config.migrations_path).await?;

        let repository = Arc::new(PostgresFooRepository::new(pool));
        let handler: Arc<dyn MessageHandler> = Arc::new(FooHandler::new(repository));

        let broker = RedpandaBroker::builder()
            .auto_offset_reset(&config.kafka.auto_offset_reset)
            .session_timeout_ms(config.kafka.session_timeout_ms)
            .build();
        let consumer = Consumer::new(config.kafka.consumer_config(), Arc::new(broker));

        Ok(Self::from_parts(config, consumer, handler))
    }

    /// Assemble an application from already built parts.
    #[must_use]
    pub fn from_parts(config: Config, consumer: Consumer, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            config,
            consumer,
            handler,
        }
    }

    /// Start consuming, then block until an OS signal and a drained consumer.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the consumer cannot start or the signal
    /// handlers cannot be installed.
    pub async fn run(self) -> Result<(), BootstrapError> {
        let (ctx, handle, coordinator) = self.start().await?;

        if let Err(e) = coordinator.install() {
            error!(error = %e, "Failed to install signal handlers, stopping consumer");
            ctx.cancel(CancelCause::Requested("signal installation failed".to_string()));
            stop_within(handle, coordinator.grace_period()).await;
            return Err(e.into());
        }

        Self::drain(&ctx, coordinator, handle).await;
        Ok(())
    }

    /// Like [`run`](Self::run), with signals taken from `signals` instead of the OS.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Consumer`] if the consumer cannot start.
    pub async fn run_with_signals<S>(self, signals: S) -> Result<Vec<ConsumerReport>, BootstrapError>
    where
        S: Stream<Item = ShutdownSignal> + Send + 'static,
    {
        let (ctx, handle, coordinator) = self.start().await?;
        coordinator.listen(signals);
        Ok(Self::drain(&ctx, coordinator, handle).await)
    }

    async fn start(
        self,
    ) -> Result<(CancellationContext, ConsumerHandle, ShutdownCoordinator), BootstrapError> {
        let ctx = CancellationContext::new();
        let handle = self.consumer.start(ctx.clone(), self.handler).await?;
        let coordinator = ShutdownCoordinator::new(ctx.clone(), self.config.shutdown_timeout);

        info!(
            topics = ?self.config.kafka.topics,
            group_id = %self.config.kafka.group_id,
            "Running kafka consumer"
        );
        Ok((ctx, handle, coordinator))
    }

    /// Wait for shutdown; a missed grace period is logged, not returned.
    async fn drain(
        ctx: &CancellationContext,
        coordinator: ShutdownCoordinator,
        handle: ConsumerHandle,
    ) -> Vec<ConsumerReport> {
        let outcome = coordinator.wait([handle]).await;
        let cause = ctx
            .cause()
            .map_or_else(|| "unknown".to_string(), |c| c.to_string());

        match outcome {
            Ok(reports) => {
                for report in &reports {
                    info!(
                        handled = report.stats.handled,
                        failed = report.stats.failed,
                        committed = report.stats.committed,
                        commit_failures = report.stats.commit_failures,
                        poll_errors = report.stats.poll_errors,
                        halted_partitions = ?report.halted_partitions,
                        "Consumer drained"
                    );
                }
                info!(cause = %cause, "Consumer stopped, exiting");
                reports
            }
            Err(e) => {
                error!(cause = %cause, error = %e, "Consumer did not drain in time, exiting anyway");
                Vec::new()
            }
        }
    }
}

/// Wait at most `grace` for an already cancelled consumer, aborting it after.
///
/// Returns whether the loop finished on its own.
async fn stop_within(handle: ConsumerHandle, grace: Duration) -> bool {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle.wait()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "Consumer loop ended abnormally");
            true
        }
        Err(_) => {
            abort.abort();
            warn!(grace_period = ?grace, "Consumer did not stop within the grace period, aborting");
            false
        }
    }
}
