//! Per-message routes: sealing and receipts

use super::validate_body;
use crate::messaging::{Caller, MessagingService};
use actix_web::{post, web, Error, HttpResponse};
use serde::Deserialize;
use validator::Validate;

pub(super) fn configure(conf: &mut actix_web::web::ServiceConfig) {
    conf.service(encrypt_message)
        .service(decrypt_message)
        .service(mark_delivered)
        .service(mark_read);
}

#[derive(Debug, Deserialize, Validate)]
pub struct EncryptForm {
    #[validate(length(min = 1, max = 1000))]
    pub secret: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DecryptForm {
    #[validate(length(min = 1, max = 1000))]
    pub secret: String,
    /// Base64 salt. Defaults to the one stored with the message.
    #[validate(length(max = 64))]
    pub salt: Option<String>,
}

/// POST /messages/{id}/encrypt
#[post("/messages/{id}/encrypt")]
pub async fn encrypt_message(
    caller: Caller,
    service: web::Data<MessagingService>,
    message_id: web::Path<i32>,
    form: web::Json<EncryptForm>,
) -> Result<HttpResponse, Error> {
    caller.require_login()?;
    validate_body(&*form)?;

    let message = service
        .encrypt_message(caller, *message_id, &form.secret)
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

/// POST /messages/{id}/decrypt
#[post("/messages/{id}/decrypt")]
pub async fn decrypt_message(
    caller: Caller,
    service: web::Data<MessagingService>,
    message_id: web::Path<i32>,
    form: web::Json<DecryptForm>,
) -> Result<HttpResponse, Error> {
    caller.require_login()?;
    validate_body(&*form)?;

    let decrypted = service
        .decrypt_message(caller, *message_id, &form.secret, form.salt.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(decrypted))
}

/// POST /messages/{id}/delivered
#[post("/messages/{id}/delivered")]
pub async fn mark_delivered(
    caller: Caller,
    service: web::Data<MessagingService>,
    message_id: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    let message = service.mark_delivered(caller, *message_id).await?;
    Ok(HttpResponse::Ok().json(message))
}

/// POST /messages/{id}/read
#[post("/messages/{id}/read")]
pub async fn mark_read(
    caller: Caller,
    service: web::Data<MessagingService>,
    message_id: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    let message = service.mark_read(caller, *message_id).await?;
    Ok(HttpResponse::Ok().json(message))
}
