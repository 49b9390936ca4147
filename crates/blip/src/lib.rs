//! Capability surface over an established BLIP connection.
//!
//! The actual framed transport (socket handling, frame interleaving,
//! compression on the wire) lives elsewhere; replication code only sees
//! [`BlipMessage`] values, the [`BlipSender`] half it may queue requests on,
//! and the reply futures that pair a request with its response.

mod channel;
mod message;
mod sender;

pub use channel::{channel_pair, ChannelSender};
pub use message::{BlipMessage, ERROR_CODE, ERROR_DOMAIN, ERROR_DOMAIN_HTTP, PROFILE};
pub use sender::{BlipSender, IncomingMessage, OutgoingRequest, ReplyFuture, SenderClosed};
