//! Kafka consumer service.
//!
//! Consumes JSON `foo` records from Kafka and upserts them into PostgreSQL.
//!
//! - **`config`**: Environment-driven configuration
//! - **`foo`**: The domain record and its repositories
//! - **`handler`**: The message handler plugged into the consumer runtime
//! - **`bootstrap`**: Logging, database, broker wiring and the run loop

pub mod bootstrap;
pub mod config;
pub mod foo;
pub mod handler;

pub use bootstrap::{Application, BootstrapError};
pub use config::{Config, ConfigError};
