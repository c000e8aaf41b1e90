//! Test database setup and management
#![allow(dead_code)]

use bazaar_messaging::db::{connect, create_schema};
use sea_orm::{DatabaseConnection, DbErr};
use tempfile::TempDir;

/// A throwaway SQLite database. The file is removed when this is dropped.
pub struct TestDatabase {
    pub db: DatabaseConnection,
    _dir: TempDir,
}

/// Create a fresh database with the messaging schema.
pub async fn setup_test_database() -> Result<TestDatabase, DbErr> {
    let dir = TempDir::new().map_err(|e| DbErr::Custom(e.to_string()))?;
    let path = dir.path().join("messaging_test.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());

    // One connection keeps SQLite writers from contending for the file lock
    let db = connect(&url, 1).await?;
    create_schema(&db).await?;

    Ok(TestDatabase { db, _dir: dir })
}
