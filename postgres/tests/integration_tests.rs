//! Integration tests for pool construction and migrations using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running. Tests are ignored by default:
//!
//! ```bash
//! cargo test -p kafka-consumer-postgres --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use kafka_consumer_postgres::{DatabaseConfig, connect, migrate};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

const MIGRATIONS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../migrations");

async fn start_postgres() -> (ContainerAsync<Postgres>, DatabaseConfig) {
    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start Postgres container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let config = DatabaseConfig::new(format!(
        "postgres://postgres:postgres@{host}:{port}/postgres"
    ));
    (container, config)
}

#[tokio::test]
#[ignore]
async fn migrations_create_the_foos_table() {
    let (_container, config) = start_postgres().await;
    let pool = connect(&config).await.expect("Failed to connect");

    migrate(&pool, MIGRATIONS).await.expect("Failed to migrate");

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'foos')",
    )
    .fetch_one(&pool)
    .await
    .expect("Failed to query schema");
    assert!(exists);
}

#[tokio::test]
#[ignore]
async fn migrations_are_idempotent() {
    let (_container, config) = start_postgres().await;
    let pool = connect(&config).await.expect("Failed to connect");

    migrate(&pool, MIGRATIONS).await.expect("First migration failed");
    migrate(&pool, MIGRATIONS).await.expect("Second migration failed");
}
