//! Graceful shutdown coordination.
//!
//! The coordinator turns the first operator signal into a cancellation of the
//! shared [`CancellationContext`] and then lets the process exit only after
//! every consumer loop has drained, or after the grace period runs out.
//!
//! ## State Machine
//!
//! ```text
//! Armed ──first signal──▶ Triggered ──loops drained / grace elapsed──▶ Confirmed
//! ```
//!
//! - Repeated signals are counted and logged but act only once.
//! - [`ShutdownCoordinator::wait`] parks on the context; it never spins.
//! - The grace period is a single deadline shared by every consumer loop.
//!
//! ## Usage
//!
//! ```ignore
//! let coordinator = ShutdownCoordinator::new(ctx.clone(), Duration::from_secs(10));
//!
//! // Start consuming first, then install the signal handlers
//! let handle = consumer.start(ctx, handler).await?;
//! coordinator.install()?;
//!
//! // Returns after a signal and a drained loop
//! let reports = coordinator.wait(vec![handle]).await?;
//! ```

use crate::consumer::{ConsumerHandle, ConsumerReport};
use crate::metrics::SHUTDOWN_SIGNALS;
use crate::signals;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use kafka_consumer_core::{CancelCause, CancellationContext, ShutdownSignal};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Shutdown errors.
#[derive(Error, Debug)]
pub enum ShutdownError {
    /// Consumer loops did not drain within the grace period and were aborted
    #[error("Shutdown timed out after {grace:?} with {pending} consumer loop(s) still running")]
    Timeout {
        /// Configured grace period
        grace: Duration,
        /// Loops still running at the deadline
        pending: usize,
    },

    /// OS signal handlers could not be registered
    #[error("Failed to install signal handlers: {0}")]
    SignalInstall(#[from] io::Error),
}

/// Lifecycle of a [`ShutdownCoordinator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    /// Waiting for the first signal
    Armed = 0,
    /// A signal arrived and the context is cancelled
    Triggered = 1,
    /// Consumer loops have drained or were aborted; the process may exit
    Confirmed = 2,
}

impl ShutdownState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Armed,
            1 => Self::Triggered,
            _ => Self::Confirmed,
        }
    }
}

struct Inner {
    context: CancellationContext,
    state: AtomicU8,
    signals_received: AtomicU64,
    grace_period: Duration,
}

/// Coordinates signal reception, cancellation and the final drain.
///
/// Cloning is cheap; every clone drives the same state machine.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("signals_received", &self.signals_received())
            .field("grace_period", &self.inner.grace_period)
            .finish_non_exhaustive()
    }
}

impl ShutdownCoordinator {
    /// Create an armed coordinator that cancels `context` on the first signal.
    ///
    /// # Arguments
    ///
    /// * `grace_period` - Maximum time to wait for consumer loops after cancellation
    #[must_use]
    pub fn new(context: CancellationContext, grace_period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                state: AtomicU8::new(ShutdownState::Armed as u8),
                signals_received: AtomicU64::new(0),
                grace_period,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Signals delivered so far, including ignored repeats.
    #[must_use]
    pub fn signals_received(&self) -> u64 {
        self.inner.signals_received.load(Ordering::Acquire)
    }

    /// Configured grace period.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.inner.grace_period
    }

    /// Register OS signal handlers and start listening.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::SignalInstall`] if the handlers cannot be registered.
    pub fn install(&self) -> Result<JoinHandle<()>, ShutdownError> {
        let signals = signals::os_signals()?;
        info!("Listening for shutdown signals (SIGINT, SIGTERM)");
        Ok(self.listen(signals))
    }

    /// Drive the coordinator from an arbitrary signal stream.
    ///
    /// The listener keeps draining the stream after the first signal so that
    /// repeats are still counted.
    pub fn listen<S>(&self, signals: S) -> JoinHandle<()>
    where
        S: Stream<Item = ShutdownSignal> + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut signals = std::pin::pin!(signals);
            while let Some(signal) = signals.next().await {
                coordinator.trigger(signal);
            }
        })
    }

    /// Record a signal delivery.
    ///
    /// Returns `true` only for the delivery that moved the coordinator from
    /// `Armed` to `Triggered`.
    pub fn trigger(&self, signal: ShutdownSignal) -> bool {
        let received = self.inner.signals_received.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::counter!(SHUTDOWN_SIGNALS, "signal" => signal.to_string()).increment(1);

        let armed = self
            .inner
            .state
            .compare_exchange(
                ShutdownState::Armed as u8,
                ShutdownState::Triggered as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if armed {
            self.inner.context.cancel(CancelCause::Signal(signal));
            info!(signal = %signal, "Shutdown signal received, cancelling consumers");
        } else {
            debug!(
                signal = %signal,
                received,
                state = ?self.state(),
                "Shutdown already in progress, ignoring signal"
            );
        }

        armed
    }

    /// Park until the context is cancelled, then wait for every consumer loop.
    ///
    /// All loops share one deadline of `now + grace_period`. Loops still
    /// running at the deadline are aborted. The coordinator is `Confirmed`
    /// when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Timeout`] if any loop missed the deadline.
    pub async fn wait<I>(self, handles: I) -> Result<Vec<ConsumerReport>, ShutdownError>
    where
        I: IntoIterator<Item = ConsumerHandle>,
    {
        self.inner.context.cancelled().await;

        // Cancellation may come from outside the coordinator.
        let _ = self.inner.state.compare_exchange(
            ShutdownState::Armed as u8,
            ShutdownState::Triggered as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let handles: Vec<ConsumerHandle> = handles.into_iter().collect();
        let aborts: Vec<AbortHandle> = handles.iter().map(ConsumerHandle::abort_handle).collect();
        let grace = self.inner.grace_period;

        info!(
            cause = %self.inner.context.cause().map_or_else(|| "unknown".to_string(), |c| c.to_string()),
            consumers = handles.len(),
            grace_period = ?grace,
            "Shutdown triggered, waiting for consumer loops to drain"
        );

        let mut waiting: FuturesUnordered<_> = handles.into_iter().map(ConsumerHandle::wait).collect();
        let mut reports = Vec::with_capacity(waiting.len());
        let deadline = Instant::now() + grace;

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(result) = waiting.next().await {
                match result {
                    Ok(report) => reports.push(report),
                    Err(e) => error!(error = %e, "Consumer loop ended abnormally"),
                }
            }
        })
        .await;

        let outcome = if drained.is_ok() {
            info!(consumers = reports.len(), "All consumer loops drained");
            Ok(reports)
        } else {
            let pending = waiting.len();
            drop(waiting);
            for abort in &aborts {
                abort.abort();
            }
            error!(
                grace_period = ?grace,
                pending,
                "Consumer loops did not drain within the grace period, aborting"
            );
            Err(ShutdownError::Timeout { grace, pending })
        };

        self.inner
            .state
            .store(ShutdownState::Confirmed as u8, Ordering::Release);
        info!("Shutdown confirmed");

        outcome
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn coordinator() -> (CancellationContext, ShutdownCoordinator) {
        let ctx = CancellationContext::new();
        let coordinator = ShutdownCoordinator::new(ctx.clone(), Duration::from_secs(1));
        (ctx, coordinator)
    }

    #[test]
    fn starts_armed() {
        let (ctx, coordinator) = coordinator();

        assert_eq!(coordinator.state(), ShutdownState::Armed);
        assert_eq!(coordinator.signals_received(), 0);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn first_trigger_cancels_context() {
        let (ctx, coordinator) = coordinator();

        assert!(coordinator.trigger(ShutdownSignal::Terminate));
        assert!(!coordinator.trigger(ShutdownSignal::Interrupt));

        assert_eq!(coordinator.state(), ShutdownState::Triggered);
        assert_eq!(coordinator.signals_received(), 2);
        assert_eq!(
            ctx.cause(),
            Some(CancelCause::Signal(ShutdownSignal::Terminate))
        );
    }

    #[tokio::test]
    async fn listen_counts_every_delivery() {
        let (ctx, coordinator) = coordinator();
        let signals = futures::stream::iter(vec![
            ShutdownSignal::Interrupt,
            ShutdownSignal::Interrupt,
            ShutdownSignal::Terminate,
        ]);

        coordinator.listen(signals).await.unwrap();

        assert_eq!(coordinator.signals_received(), 3);
        assert_eq!(
            ctx.cause(),
            Some(CancelCause::Signal(ShutdownSignal::Interrupt))
        );
    }

    #[tokio::test]
    async fn wait_without_consumers_confirms_after_cancellation() {
        let (_ctx, coordinator) = coordinator();
        let observer = coordinator.clone();

        let waiter = tokio::spawn(coordinator.wait(Vec::<ConsumerHandle>::new()));
        tokio::task::yield_now().await;
        assert_eq!(observer.state(), ShutdownState::Armed);

        observer.trigger(ShutdownSignal::Interrupt);
        let reports = waiter.await.unwrap().unwrap();

        assert!(reports.is_empty());
        assert_eq!(observer.state(), ShutdownState::Confirmed);
    }

    #[tokio::test]
    async fn external_cancellation_also_confirms() {
        let (ctx, coordinator) = coordinator();
        let observer = coordinator.clone();

        ctx.cancel(CancelCause::Requested("test".to_string()));
        coordinator.wait(Vec::<ConsumerHandle>::new()).await.unwrap();

        assert_eq!(observer.state(), ShutdownState::Confirmed);
        assert_eq!(observer.signals_received(), 0);
    }
}
