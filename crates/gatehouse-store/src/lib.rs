//! Storage for the gateway
//!
//! The gateway core only sees the [`Store`] trait. Two backends exist:
//! [`MemoryStore`] for single-process/no-database runs and tests, and
//! [`SeaOrmStore`] for SQLite or PostgreSQL through sea-orm.

pub mod entities;
pub mod memory;
pub mod migrator;
pub mod models;
pub mod sea_orm_store;
pub mod store;

pub use memory::MemoryStore;
pub use models::*;
pub use sea_orm_store::SeaOrmStore;
pub use store::{Store, StoreError};

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Connect to the database at `url` (e.g. `sqlite://gatehouse.db?mode=rwc`)
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    info!("Connecting to database");
    Database::connect(url).await
}

/// Apply all pending migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    migrator::Migrator::up(db, None).await?;
    info!("Database migrations applied");
    Ok(())
}
