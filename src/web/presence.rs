//! Presence routes

use crate::messaging::{Caller, MessagingService};
use actix_web::{get, post, web, Error, HttpResponse};
use serde::Deserialize;

pub(super) fn configure(conf: &mut actix_web::web::ServiceConfig) {
    conf.service(heartbeat)
        .service(update_presence)
        .service(get_presence);
}

#[derive(Debug, Deserialize)]
pub struct PresenceForm {
    pub online: Option<bool>,
    /// Privacy preference for online status
    pub show_online: Option<bool>,
}

/// POST /presence/heartbeat
#[post("/presence/heartbeat")]
pub async fn heartbeat(
    caller: Caller,
    service: web::Data<MessagingService>,
) -> Result<HttpResponse, Error> {
    service.heartbeat(caller).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /presence
#[post("/presence")]
pub async fn update_presence(
    caller: Caller,
    service: web::Data<MessagingService>,
    form: web::Json<PresenceForm>,
) -> Result<HttpResponse, Error> {
    caller.require_login()?;

    if let Some(show) = form.show_online {
        service.set_show_online(caller, show).await?;
    }
    if let Some(online) = form.online {
        service.update_presence(caller, online).await?;
    }

    Ok(HttpResponse::NoContent().finish())
}

/// GET /presence/{user_id}
#[get("/presence/{user_id}")]
pub async fn get_presence(
    caller: Caller,
    service: web::Data<MessagingService>,
    user_id: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    let view = service.get_presence(caller, *user_id).await?;
    Ok(HttpResponse::Ok().json(view))
}
