//! Conversation routes

use super::validate_body;
use crate::messaging::{Caller, MessagingService};
use actix_web::{get, post, web, Error, HttpResponse};
use serde::Deserialize;
use validator::Validate;

pub(super) fn configure(conf: &mut actix_web::web::ServiceConfig) {
    conf.service(list_conversations)
        .service(start_conversation)
        .service(list_messages)
        .service(send_message)
        .service(leave_conversation)
        .service(hide_conversation)
        .service(unhide_conversation)
        .service(get_typing)
        .service(set_typing);
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartConversationForm {
    #[validate(length(min = 1, max = 50))]
    pub participant_ids: Vec<i32>,
    #[validate(length(max = 255))]
    pub title: Option<String>,
    #[validate(length(max = 255))]
    pub subject_ref: Option<String>,
    /// Reuse the existing two-party conversation about the same subject
    #[serde(default)]
    pub direct: bool,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<u64>,
    pub before: Option<i32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageForm {
    #[validate(length(min = 1, max = 10000))]
    pub text: String,
    /// Secret to seal the message with
    #[validate(length(min = 1, max = 1000))]
    pub encrypt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TypingForm {
    pub is_typing: bool,
}

/// GET /conversations
#[get("/conversations")]
pub async fn list_conversations(
    caller: Caller,
    service: web::Data<MessagingService>,
) -> Result<HttpResponse, Error> {
    let conversations = service.list_conversations(caller).await?;
    Ok(HttpResponse::Ok().json(conversations))
}

/// POST /conversations
#[post("/conversations")]
pub async fn start_conversation(
    caller: Caller,
    service: web::Data<MessagingService>,
    form: web::Json<StartConversationForm>,
) -> Result<HttpResponse, Error> {
    caller.require_login()?;
    validate_body(&*form)?;

    let summary = match (form.direct, form.participant_ids.as_slice()) {
        (true, [other_id]) => {
            service
                .open_direct_conversation(caller, *other_id, form.subject_ref.as_deref())
                .await?
        }
        _ => {
            service
                .start_conversation(
                    caller,
                    &form.participant_ids,
                    form.title.as_deref(),
                    form.subject_ref.as_deref(),
                )
                .await?
        }
    };

    Ok(HttpResponse::Created().json(summary))
}

/// GET /conversations/{id}/messages
#[get("/conversations/{id}/messages")]
pub async fn list_messages(
    caller: Caller,
    service: web::Data<MessagingService>,
    conversation_id: web::Path<i32>,
    query: web::Query<MessagesQuery>,
) -> Result<HttpResponse, Error> {
    let messages = service
        .list_messages(caller, *conversation_id, query.limit, query.before)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// POST /conversations/{id}/messages
#[post("/conversations/{id}/messages")]
pub async fn send_message(
    caller: Caller,
    service: web::Data<MessagingService>,
    conversation_id: web::Path<i32>,
    form: web::Json<SendMessageForm>,
) -> Result<HttpResponse, Error> {
    caller.require_login()?;
    validate_body(&*form)?;

    let message = service
        .send_message(
            caller,
            *conversation_id,
            &form.text,
            form.encrypt.as_deref(),
        )
        .await?;

    Ok(HttpResponse::Created().json(message))
}

/// POST /conversations/{id}/leave
#[post("/conversations/{id}/leave")]
pub async fn leave_conversation(
    caller: Caller,
    service: web::Data<MessagingService>,
    conversation_id: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    service.leave_conversation(caller, *conversation_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /conversations/{id}/hide
#[post("/conversations/{id}/hide")]
pub async fn hide_conversation(
    caller: Caller,
    service: web::Data<MessagingService>,
    conversation_id: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    service
        .hide_conversation(caller, *conversation_id, true)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /conversations/{id}/unhide
#[post("/conversations/{id}/unhide")]
pub async fn unhide_conversation(
    caller: Caller,
    service: web::Data<MessagingService>,
    conversation_id: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    service
        .hide_conversation(caller, *conversation_id, false)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /conversations/{id}/typing
#[get("/conversations/{id}/typing")]
pub async fn get_typing(
    caller: Caller,
    service: web::Data<MessagingService>,
    conversation_id: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    let user_ids = service.typing_users(caller, *conversation_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "user_ids": user_ids })))
}

/// POST /conversations/{id}/typing
#[post("/conversations/{id}/typing")]
pub async fn set_typing(
    caller: Caller,
    service: web::Data<MessagingService>,
    conversation_id: web::Path<i32>,
    form: web::Json<TypingForm>,
) -> Result<HttpResponse, Error> {
    service
        .set_typing(caller, *conversation_id, form.is_typing)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
