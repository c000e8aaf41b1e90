//! Database pool and schema bootstrap

use crate::orm::{
    conversation_participants, conversations, encryption_keys, notifications, private_messages,
    users,
};
use once_cell::sync::OnceCell;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;

static DB_POOL: OnceCell<DatabaseConnection> = OnceCell::new();

/// Returns the global pool. Panics if `init_db` was not called.
pub fn get_db_pool() -> &'static DatabaseConnection {
    DB_POOL.get().expect("Database pool was not initialized")
}

/// Connect and install the global pool.
pub async fn init_db(database_url: String, max_connections: u32) -> Result<(), DbErr> {
    let db = connect(&database_url, max_connections).await?;
    if DB_POOL.set(db).is_err() {
        log::warn!("init_db called twice, keeping the first pool");
    }
    Ok(())
}

/// Open a new pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(database_url.to_owned());
    opt.max_connections(max_connections)
        .connect_timeout(Duration::from_secs(8))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    log::info!("Connected to database ({:?})", db.get_database_backend());
    Ok(db)
}

/// Create every messaging table that does not exist yet.
///
/// Tables are created parents first so foreign keys resolve on backends that check them.
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut statements = vec![
        schema.create_table_from_entity(users::Entity),
        schema.create_table_from_entity(conversations::Entity),
        schema.create_table_from_entity(conversation_participants::Entity),
        schema.create_table_from_entity(private_messages::Entity),
        schema.create_table_from_entity(encryption_keys::Entity),
        schema.create_table_from_entity(notifications::Entity),
    ];

    for statement in statements.iter_mut() {
        statement.if_not_exists();
        db.execute(backend.build(&*statement)).await?;
    }

    log::debug!("Messaging schema ready");
    Ok(())
}
