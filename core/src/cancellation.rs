//! Process-wide cancellation context.
//!
//! [`CancellationContext`] is a cheap, cloneable handle around a single
//! `tokio::sync::watch` channel. Every component that must observe shutdown
//! receives a clone explicitly; there is no global state.
//!
//! # Invariants
//!
//! - The transition is one-way: once cancelled, the context never resets.
//! - Only the first [`CancellationContext::cancel`] call records a cause; later
//!   calls return `false` and leave the cause untouched.
//! - [`CancellationContext::cancelled`] parks the caller until cancellation.
//!   It never polls.
//!
//! # Example
//!
//! ```
//! use kafka_consumer_core::{CancelCause, CancellationContext, ShutdownSignal};
//!
//! # tokio_test::block_on(async {
//! let ctx = CancellationContext::new();
//! let observer = ctx.clone();
//!
//! let waiter = tokio::spawn(async move { observer.cancelled().await });
//!
//! assert!(ctx.cancel(CancelCause::Signal(ShutdownSignal::Interrupt)));
//! assert!(!ctx.cancel(CancelCause::Signal(ShutdownSignal::Terminate)));
//!
//! waiter.await.unwrap();
//! assert_eq!(ctx.cause(), Some(CancelCause::Signal(ShutdownSignal::Interrupt)));
//! # });
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Operator signals that request shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

/// Why a context was cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelCause {
    /// An operator signal arrived
    Signal(ShutdownSignal),
    /// Cancellation requested programmatically
    Requested(String),
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(signal) => write!(f, "{signal} signal"),
            Self::Requested(reason) => write!(f, "requested: {reason}"),
        }
    }
}

/// Shared one-way cancellation signal with an optional cause.
#[derive(Clone, Debug)]
pub struct CancellationContext {
    state: Arc<watch::Sender<Option<CancelCause>>>,
}

impl CancellationContext {
    /// Create a context that is not yet cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Cancel the context.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// context was already cancelled. Safe to call concurrently.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        let mut cause = Some(cause);
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = cause.take();
            true
        })
    }

    /// Whether the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// The cause recorded by the first successful [`cancel`](Self::cancel).
    #[must_use]
    pub fn cause(&self) -> Option<CancelCause> {
        self.state.borrow().clone()
    }

    /// Wait until the context is cancelled.
    ///
    /// Returns immediately if it already is.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so this only resolves on cancellation.
        let _ = receiver.wait_for(Option::is_some).await;
    }
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}
