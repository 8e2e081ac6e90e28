//! `elara-db` — data model and job store for the render farm.
//!
//! The orchestrator talks to storage exclusively through the
//! [`JobStore`] trait. Two backings are provided:
//!
//! - [`MemoryStore`] — a non-durable in-memory map, used by tests and
//!   single-process setups.
//! - [`PgStore`] — the canonical durable backing on PostgreSQL.
//!
//! Every trait method is a single linearizable mutation against one
//! job row; claiming in particular is an atomic conditional status
//! transition, so two concurrent claims can never hand out the same
//! job.

pub mod models;
pub mod store;

pub use store::memory::MemoryStore;
pub use store::postgres::PgStore;
pub use store::{JobStore, StoreError};

use sqlx::postgres::PgPoolOptions;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run the embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
