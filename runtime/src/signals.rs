//! OS signal source for the shutdown coordinator.
//!
//! Handlers are registered eagerly, so a registration failure surfaces from
//! [`os_signals`] instead of at the first delivery. The returned stream yields
//! one item per delivery and never ends; repeated signals are the
//! coordinator's concern.

use futures::Stream;
use kafka_consumer_core::ShutdownSignal;
use std::io;

/// Stream of SIGINT and SIGTERM deliveries.
///
/// # Errors
///
/// Returns the underlying I/O error if a signal handler cannot be registered.
#[cfg(unix)]
pub fn os_signals() -> io::Result<impl Stream<Item = ShutdownSignal> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async_stream::stream! {
        loop {
            let received = tokio::select! {
                Some(()) = interrupt.recv() => ShutdownSignal::Interrupt,
                Some(()) = terminate.recv() => ShutdownSignal::Terminate,
                else => break,
            };
            yield received;
        }
    })
}

/// Stream of Ctrl+C deliveries.
///
/// # Errors
///
/// Returns the underlying I/O error if the Ctrl+C handler cannot be registered.
#[cfg(not(unix))]
pub fn os_signals() -> io::Result<impl Stream<Item = ShutdownSignal> + Send + 'static> {
    Ok(async_stream::stream! {
        while tokio::signal::ctrl_c().await.is_ok() {
            yield ShutdownSignal::Interrupt;
        }
    })
}
