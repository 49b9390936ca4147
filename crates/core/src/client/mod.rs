pub mod message_handlers;
pub mod messages;
pub mod session;

pub use session::{SessionConfig, SessionHooks, SubscriptionParams, SyncSession};
