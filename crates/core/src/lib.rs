//! Server-side replication protocol core of the Tidegate sync gateway.
//!
//! One [`client::SyncSession`] lives per connected peer. The transport hands
//! each inbound message to [`client::message_handlers::dispatch`], which
//! resolves the verb, refreshes the session's user where required, and runs
//! the matching checkpoint/pull/push/attachment handler against the
//! session's [`db::SyncDatabase`] view.

pub mod client;
pub mod db;
pub mod error;
pub mod repl;
pub mod util;
pub mod worker_metrics;
