//! SeaORM entities for the messaging schema

pub mod conversation_participants;
pub mod conversations;
pub mod encryption_keys;
pub mod notifications;
pub mod private_messages;
pub mod users;
