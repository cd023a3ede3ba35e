//! Persistence for segmentation tasks.
//!
//! The durable [`SegmentationTask`](models::segmentation_task::SegmentationTask)
//! row is the cross-restart source of truth for every segmentation request.
//! Callers go through the [`SegmentationStore`](store::SegmentationStore)
//! contract; [`PgSegmentationStore`](store::PgSegmentationStore) backs it with
//! Postgres and [`MemorySegmentationStore`](memory::MemorySegmentationStore)
//! keeps everything in process.

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
