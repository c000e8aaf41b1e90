//! Caller identity for messaging routes.
//!
//! The account system logs users in and stores their id in the session.
//! Routes only read it back.

use crate::messaging::Caller;
use actix_session::{Session, SessionExt, SessionInsertError};
use actix_web::dev::Payload;
use actix_web::{Error, FromRequest, HttpRequest};
use futures::future::{ready, Ready};

/// Session key holding the authenticated user id
pub const USER_ID_KEY: &str = "user_id";

/// Store the authenticated user in the session.
pub fn remember_caller(session: &Session, user_id: i32) -> Result<(), SessionInsertError> {
    session.renew();
    session.insert(USER_ID_KEY, user_id)
}

/// Provides `caller: Caller` in route parameters. Never fails; a missing or
/// unreadable session yields a guest.
impl FromRequest for Caller {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let caller = match req.get_session().get::<i32>(USER_ID_KEY) {
            Ok(Some(user_id)) => Caller::User(user_id),
            Ok(None) => Caller::Guest,
            Err(e) => {
                log::warn!("Unable to read caller from session: {}", e);
                Caller::Guest
            }
        };

        ready(Ok(caller))
    }
}
