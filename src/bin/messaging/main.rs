use actix::Actor;
use actix_session::{config::PersistentSession, storage::CookieSessionStore, SessionMiddleware};
use actix_web::cookie::{Key, SameSite};
use actix_web::middleware::Logger;
use actix_web::web::Data;
use actix_web::{App, HttpServer};
use anyhow::Context;
use bazaar_messaging::app_config::AppConfig;
use bazaar_messaging::db::{create_schema, get_db_pool, init_db};
use bazaar_messaging::fanout::ConversationHub;
use env_logger::Env;
use std::sync::Arc;
use std::time::Duration;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_lib_mods();

    let config = AppConfig::load().context("Failed to load configuration")?;

    init_db(config.database.url.clone(), config.database.max_connections)
        .await
        .context("Failed to connect to the database")?;
    let db = get_db_pool().clone();

    if config.database.create_schema {
        create_schema(&db)
            .await
            .context("Failed to create messaging schema")?;
    }

    let hub = ConversationHub::new(config.server.hub_mailbox_capacity).start();
    let service = bazaar_messaging::build_service(db, Arc::new(hub.clone()), &config);

    if config.presence.reaper_interval_secs > 0 {
        bazaar_messaging::spawn_presence_reaper(
            service.presence().clone(),
            Duration::from_secs(config.presence.reaper_interval_secs),
        );
    }

    let secret_key = session_key(&config.server.session_key);
    let bind = (config.server.bind.clone(), config.server.port);
    log::info!("Messaging listening on {}:{}", bind.0, bind.1);

    HttpServer::new(move || {
        // Middleware is in REVERSE EXECUTION ORDER.
        App::new()
            .app_data(Data::new(service.clone()))
            .app_data(Data::new(hub.clone()))
            .wrap(
                SessionMiddleware::builder(CookieSessionStore::default(), secret_key.clone())
                    .cookie_same_site(SameSite::Lax)
                    .session_lifecycle(PersistentSession::default())
                    .build(),
            )
            .wrap(Logger::new("%a %r %s %Dms"))
            .configure(bazaar_messaging::web::configure)
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}

/// Initialize third party crates we rely on but don't have control over.
fn init_lib_mods() {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("No .env loaded: {}", e);
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
}

fn session_key(configured: &str) -> Key {
    if configured.len() >= 64 {
        return Key::from(configured.as_bytes());
    }

    log::warn!(
        "server.session_key is missing or shorter than 64 bytes. Session cookies \
         will be invalidated every time the application is restarted."
    );
    Key::generate()
}
