//! JSON and WebSocket routes for messaging.

pub mod conversations;
pub mod live;
pub mod messages;
pub mod presence;

use actix_web::{error, Error};
use validator::Validate;

/// Configures the web app by adding services from each web file.
pub fn configure(conf: &mut actix_web::web::ServiceConfig) {
    // Route resolution stops at the first match.
    live::configure(conf);
    conversations::configure(conf);
    messages::configure(conf);
    presence::configure(conf);
}

/// Reject a request body that fails its field rules with 400.
pub(crate) fn validate_body<T: Validate>(body: &T) -> Result<(), Error> {
    body.validate().map_err(|e| {
        log::debug!("Request validation failed: {}", e);
        error::ErrorBadRequest("Invalid request")
    })
}
