//! Message handler contract.
//!
//! The runtime invokes [`MessageHandler::handle`] once per message, sequentially
//! within a partition. Handlers decode the raw value into a domain record and
//! forward it to a persistence collaborator.
//!
//! # Requirements
//!
//! - **Stateless**: one handler instance is shared by every partition lane
//! - **Idempotent**: delivery is at-least-once, so the same message may arrive twice
//! - **Bounded**: shutdown waits for the call in flight, so persistence calls need their own timeout
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl MessageHandler for PrintHandler {
//!     async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
//!         let text = std::str::from_utf8(&message.value)
//!             .map_err(|e| HandlerError::Decode(e.to_string()))?;
//!         println!("{text}");
//!         Ok(())
//!     }
//! }
//! ```

use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;

/// Per-message failures.
///
/// Neither variant stops the consumer loop; both are logged with the message
/// coordinates and the offset is left uncommitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The message value could not be decoded into a domain record
    #[error("Decode error: {0}")]
    Decode(String),

    /// The decoded record could not be persisted
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Processes one message at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a single message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Decode`] for malformed payloads and
    /// [`HandlerError::Persistence`] when the record could not be stored.
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}
