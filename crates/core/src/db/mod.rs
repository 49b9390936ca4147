//! The database capability consumed by the replication core.
//!
//! Everything behind [`SyncDatabase`] — bucket I/O, the revision tree, the
//! channel index, the JSON-diff engine — lives in the storage layer. The
//! protocol core only ever talks to these traits, which keeps a session's
//! user-bound view swappable in one pointer store.

mod delta;
mod document;
pub mod tests_utils;

pub use delta::apply_delta;
pub use document::Document;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::SyncError;
use crate::util::Terminator;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Reserved body keys, stripped from or injected into business bodies.
pub const BODY_ID: &str = "_id";
pub const BODY_REV: &str = "_rev";
pub const BODY_DELETED: &str = "_deleted";
pub const BODY_ATTACHMENTS: &str = "_attachments";
pub const BODY_EXPIRY: &str = "_exp";

/// The non-replicated namespace checkpoints are stored in.
pub const SPECIAL_KIND_LOCAL: &str = "local";

/// A position in the database's change stream. The database owns the
/// grammar; the core treats values as opaque and orderable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, From, Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(pub u64);

/// One entry from the change feed. `revs` carries the alternate leaf
/// revisions of the document at this sequence; the pull engine flattens the
/// entry into one protocol row per alternate.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub seq: SequenceId,
    pub id: String,
    pub revs: Vec<String>,
    pub deleted: bool,
}

/// Result of comparing a pushed revision against the local revision tree.
#[derive(Debug, Clone, Default)]
pub struct RevDiff {
    /// Revisions the database does not have. Empty means the rev is known.
    pub missing: Vec<String>,
    /// Revisions the database does have that could serve as ancestors.
    pub possible_ancestors: Vec<String>,
}

/// Result of asking the database for a delta between two revisions.
#[derive(Debug, Clone, Default)]
pub struct RevDelta {
    /// JSON patch from the source rev's body to the target's; `None` when
    /// the database declined to produce one.
    pub delta: Option<Bytes>,
    /// Set when the requester may only see the target in redacted form; the
    /// caller ships this document instead of a delta.
    pub redacted_rev: Option<Document>,
}

#[derive(Debug, Clone, Default)]
pub struct AttachmentMeta {
    pub content_type: Option<String>,
    pub length: u64,
}

/// One unresolved attachment reference from a pushed revision body.
#[derive(Debug, Clone)]
pub struct StubAttachment {
    pub name: String,
    pub digest: String,
    /// The blob bytes when the database already holds this digest.
    pub known_data: Option<Bytes>,
    pub meta: AttachmentMeta,
}

/// Resolves stub attachments during a pushed revision, one at a time.
#[async_trait]
pub trait StubAttachmentResolver: Send {
    /// Return the downloaded bytes to store against the digest, or `None`
    /// when the blob was already held locally and its possession verified.
    async fn resolve(&mut self, stub: StubAttachment) -> Result<Option<Bytes>, SyncError>;
}

/// Consumes batches from the change feed.
#[async_trait]
pub trait ChangesSink: Send {
    /// One batch from the feed. An empty batch means the feed has caught up
    /// with the end of the stream. An `Err` stops the feed; the generator
    /// reports a forced close.
    async fn on_changes(&mut self, batch: Vec<ChangeEntry>) -> Result<(), SyncError>;
}

#[derive(Clone)]
pub struct ChangesOptions {
    pub since: SequenceId,
    pub continuous: bool,
    pub active_only: bool,
    /// Fired on session shutdown; the feed observes it between iterations.
    pub terminator: Terminator,
}

/// An authenticated principal and the channel grants attached to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPrincipal {
    pub name: String,
    pub roles: Vec<String>,
    pub channels: HashSet<String>,
}

impl UserPrincipal {
    /// The keys whose mutation must bump the user-change counter: the user
    /// record itself plus each granted role.
    pub fn tracked_keys(&self) -> HashSet<String> {
        let mut keys = HashSet::with_capacity(1 + self.roles.len());
        keys.insert(format!("user:{}", self.name));
        for role in &self.roles {
            keys.insert(format!("role:{role}"));
        }
        keys
    }

    pub fn can_see_channel(&self, channel: &str) -> bool {
        self.channels.contains("*") || self.channels.contains(channel)
    }
}

/// Looks up principals by name. Backed by the same store the user-change
/// counter watches, so a post-bump read observes the new grants.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn get_user(&self, name: &str) -> Result<Arc<UserPrincipal>, SyncError>;
}

/// Watches for mutations of a session's principal or any of its roles.
pub trait UserChangeWaiter: Send + Sync {
    /// Monotonic counter, bumped whenever a tracked key's record changes.
    fn count(&self) -> u64;

    /// Replace the tracked key set after a refresh reinstalls the user.
    fn set_tracked_keys(&self, keys: HashSet<String>);
}

/// A user-bound view of one database, as consumed by the protocol core.
///
/// Views are cheap handles; [`SyncDatabase::with_user`] produces a sibling
/// view over the same store bound to a different principal, which is how the
/// permission-refresh interlock swaps a session's access rights without
/// disturbing tasks still holding the old view.
#[async_trait]
pub trait SyncDatabase: Send + Sync {
    fn name(&self) -> &str;

    /// The bound principal; `None` means admin/anonymous bypass.
    fn user(&self) -> Option<Arc<UserPrincipal>>;

    fn with_user(&self, user: Option<Arc<UserPrincipal>>) -> Arc<dyn SyncDatabase>;

    fn authenticator(&self) -> Arc<dyn Authenticator>;

    fn user_change_waiter(&self) -> Arc<dyn UserChangeWaiter>;

    fn allow_conflicts(&self) -> bool;

    fn create_zero_since_value(&self) -> SequenceId;

    fn parse_sequence_id(&self, s: &str) -> Result<SequenceId, SyncError>;

    /// Wake change feeds blocked on behalf of `user_name` so they can
    /// observe a forced close.
    fn notify_terminated_changes(&self, user_name: &str);

    async fn get_special(&self, kind: &str, id: &str) -> Result<Option<JsonMap>, SyncError>;

    /// Write a document in a non-replicated namespace with optimistic
    /// concurrency on the `_rev` member of `body`. Returns the new rev.
    async fn put_special(&self, kind: &str, id: &str, body: JsonMap) -> Result<String, SyncError>;

    async fn rev_diff(&self, doc_id: &str, revs: &[String]) -> RevDiff;

    /// Gatekeeper for no-conflicts pushes; `0` means "accepted, send it".
    async fn check_proposed_rev(&self, doc_id: &str, rev: &str, parent_rev: Option<&str>) -> u64;

    /// Access-checked revision read. `ancestors`, when given, lets the
    /// database truncate the returned history below the peer's known revs.
    async fn get_rev(
        &self,
        doc_id: &str,
        rev_id: Option<&str>,
        attachments_inline: bool,
        ancestors: Option<&[String]>,
    ) -> Result<Document, SyncError>;

    async fn put_existing_rev(
        &self,
        doc: Document,
        history: Vec<String>,
        no_conflicts: bool,
    ) -> Result<(), SyncError>;

    async fn get_delta(&self, doc_id: &str, from_rev: &str, to_rev: &str) -> Result<RevDelta, SyncError>;

    async fn get_attachment(&self, digest: &str) -> Result<Bytes, SyncError>;

    /// Walk the stub attachments of `body` whose revpos is at or above
    /// `min_revpos`, calling `resolver` for each, and store any bytes it
    /// returns against their digest.
    async fn for_each_stub_attachment(
        &self,
        body: &mut JsonMap,
        min_revpos: u64,
        resolver: &mut dyn StubAttachmentResolver,
    ) -> Result<(), SyncError>;

    /// Drive the change feed for this view, forwarding batches into `sink`
    /// until the stream ends (one-shot), the terminator fires, or the sink
    /// errors. Returns `true` iff the feed was forcibly closed.
    async fn generate_sync_changes(
        &self,
        channels: HashSet<String>,
        options: ChangesOptions,
        doc_ids: Vec<String>,
        sink: &mut dyn ChangesSink,
    ) -> bool;
}

/// Content digest identifying an attachment blob.
pub fn attachment_digest(data: &[u8]) -> String {
    format!("sha1-{}", BASE64.encode(Sha1::digest(data)))
}

/// Proof that the holder of `data` saw `nonce`: the digest of the
/// length-prefixed nonce followed by the blob.
pub fn proof_of_attachment(nonce: &[u8], data: &[u8]) -> Result<String, SyncError> {
    if nonce.is_empty() || nonce.len() > 255 {
        return Err(SyncError::bad_request(format!(
            "invalid attachment proof nonce length {}",
            nonce.len()
        )));
    }
    let mut hasher = Sha1::new();
    hasher.update([nonce.len() as u8]);
    hasher.update(nonce);
    hasher.update(data);
    Ok(BASE64.encode(hasher.finalize()))
}

/// The generation prefix of a revision id like `3-abc`; 0 when malformed.
pub fn rev_generation(rev: &str) -> u64 {
    rev.split('-').next().and_then(|g| g.parse().ok()).unwrap_or(0)
}
