use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed, Ordering::SeqCst};
use std::sync::Arc;

use tidegate_blip::{BlipSender, OutgoingRequest};

use crate::db::{SyncDatabase, UserChangeWaiter};
use crate::error::SyncError;
use crate::util::Terminator;

/// Per-session knobs, fixed at connection time.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Batch size used when `subChanges` does not supply one.
    pub default_batch_size: usize,
    /// Acknowledge successful responses with a `handler` property naming
    /// the verb. Diagnostic aid; off in production.
    pub show_handler: bool,
    /// Whether delta encoding is permitted on this database at all.
    pub allow_deltas: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 200,
            show_handler: false,
            allow_deltas: true,
        }
    }
}

/// Callbacks the embedding layers onto protocol progress.
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// Receives the sequences of the rows a pushing peer was told to send.
    pub post_handle_changes: Option<Arc<dyn Fn(Vec<String>) + Send + Sync>>,
    /// Receives the sequence property of each persisted pushed revision.
    pub post_handle_rev: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

/// Parameters of the active sub-changes subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionParams {
    pub batch_size: usize,
    pub continuous: bool,
    pub active_only: bool,
    /// Expanded channel set; empty means all channels.
    pub channels: HashSet<String>,
}

struct UserState {
    db: Arc<dyn SyncDatabase>,
    last_user_count: u64,
}

/// Per-peer session state, shared by every handler on one connection.
///
/// Constructed once the peer has authenticated and the transport upgrade
/// completed; dropped when the connection closes. All mutability is interior
/// so the session can be handed around as `Arc<SyncSession>`.
pub struct SyncSession {
    peer_id: String,
    config: SessionConfig,
    hooks: SessionHooks,
    sender: Arc<dyn BlipSender>,
    /// Guards the user-bound DB view and its change-counter observation.
    /// Held across the authenticator read during a refresh, hence async.
    user_state: tokio::sync::Mutex<UserState>,
    user_name: parking_lot::Mutex<String>,
    waiter: Arc<dyn UserChangeWaiter>,
    active_sub_changes: AtomicBool,
    got_sub_changes: AtomicBool,
    subscription: parking_lot::Mutex<SubscriptionParams>,
    terminator: Terminator,
    /// digest → refcount; a digest is serveable iff present.
    allowed_attachments: parking_lot::Mutex<HashMap<String, u32>>,
    serial: AtomicU64,
    peer_accepts_deltas: AtomicBool,
}

impl SyncSession {
    pub fn new(
        peer_id: impl Into<String>,
        sender: Arc<dyn BlipSender>,
        db: Arc<dyn SyncDatabase>,
        config: SessionConfig,
        hooks: SessionHooks,
    ) -> Arc<Self> {
        let waiter = db.user_change_waiter();
        let user_name = match db.user() {
            Some(user) => {
                waiter.set_tracked_keys(user.tracked_keys());
                user.name.clone()
            }
            None => String::new(),
        };
        let last_user_count = waiter.count();
        Arc::new(Self {
            peer_id: peer_id.into(),
            config,
            hooks,
            sender,
            user_state: tokio::sync::Mutex::new(UserState { db, last_user_count }),
            user_name: parking_lot::Mutex::new(user_name),
            waiter,
            active_sub_changes: AtomicBool::new(false),
            got_sub_changes: AtomicBool::new(false),
            subscription: parking_lot::Mutex::new(SubscriptionParams::default()),
            terminator: Terminator::new(),
            allowed_attachments: parking_lot::Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
            peer_accepts_deltas: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn hooks(&self) -> &SessionHooks {
        &self.hooks
    }

    /// The authenticated principal's name; empty means admin/anonymous.
    pub fn user_name(&self) -> String {
        self.user_name.lock().clone()
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    /// Tear the session down: fires the terminator so every in-flight change
    /// feed observes the close and exits.
    pub fn close(&self) {
        if self.terminator.fire() {
            log::debug!("[{}] session closed", self.peer_id);
        }
    }

    /// Snapshot of the current user-bound database view. Tasks that outlive
    /// their triggering message hold this snapshot; a later user swap does
    /// not disturb them.
    pub async fn copy_context_database(&self) -> Arc<dyn SyncDatabase> {
        self.user_state.lock().await.db.clone()
    }

    /// The permission-refresh interlock. If the user's change counter has
    /// advanced since the last observation, re-read the principal, reinstall
    /// its tracked keys into the waiter, and swap the session's DB view.
    /// Returns the view the caller should use from here on.
    pub async fn refresh_user(&self) -> Result<Arc<dyn SyncDatabase>, SyncError> {
        let mut state = self.user_state.lock().await;
        let count = self.waiter.count();
        if count == state.last_user_count {
            return Ok(state.db.clone());
        }
        let name = self.user_name.lock().clone();
        if name.is_empty() {
            // Admin bypass: nothing to reload.
            state.last_user_count = count;
            return Ok(state.db.clone());
        }
        let user = state.db.authenticator().get_user(&name).await?;
        self.waiter.set_tracked_keys(user.tracked_keys());
        log::debug!("[{}] reloaded user {name:?} after external change", self.peer_id);
        let db = state.db.with_user(Some(user));
        state.db = db.clone();
        state.last_user_count = count;
        Ok(db)
    }

    /// Serial tag for the next inbound message. Strictly monotonic per
    /// session.
    pub fn increment_serial_number(&self) -> u64 {
        self.serial.fetch_add(1, SeqCst) + 1
    }

    pub fn sub_changes_active(&self) -> bool {
        self.active_sub_changes.load(SeqCst)
    }

    /// Claim the single change-feed slot. Fails when a feed is running.
    pub(crate) fn try_begin_sub_changes(&self) -> bool {
        let claimed = self
            .active_sub_changes
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok();
        if claimed {
            self.got_sub_changes.store(true, Relaxed);
        }
        claimed
    }

    pub(crate) fn end_sub_changes(&self) {
        self.active_sub_changes.store(false, SeqCst);
    }

    /// Whether this peer has ever opened a subscription.
    pub fn got_sub_changes(&self) -> bool {
        self.got_sub_changes.load(Relaxed)
    }

    pub(crate) fn record_subscription(&self, params: SubscriptionParams) {
        *self.subscription.lock() = params;
    }

    pub fn subscription(&self) -> SubscriptionParams {
        self.subscription.lock().clone()
    }

    pub(crate) fn add_allowed_attachments(&self, digests: &[String]) {
        let mut allowed = self.allowed_attachments.lock();
        for digest in digests {
            *allowed.entry(digest.clone()).or_insert(0) += 1;
        }
    }

    pub(crate) fn remove_allowed_attachments(&self, digests: &[String]) {
        let mut allowed = self.allowed_attachments.lock();
        for digest in digests {
            match allowed.get_mut(digest) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    allowed.remove(digest);
                }
                None => {
                    log::warn!("[{}] unbalanced release of attachment {digest:?}", self.peer_id);
                }
            }
        }
    }

    pub fn is_attachment_allowed(&self, digest: &str) -> bool {
        self.allowed_attachments.lock().contains_key(digest)
    }

    /// Queue a message on the transport. Returns `false` iff the connection
    /// has closed.
    pub fn send_blip_message(&self, request: OutgoingRequest) -> bool {
        self.sender.send(request)
    }

    /// Server-side delta switch; gates inbound `deltaSrc` revs.
    pub fn deltas_enabled(&self) -> bool {
        self.config.allow_deltas
    }

    /// Negotiated switch for outbound deltas: on only after the peer has
    /// advertised support on a changes response.
    pub fn can_send_deltas(&self) -> bool {
        self.peer_accepts_deltas.load(Relaxed)
    }

    pub(crate) fn set_peer_accepts_deltas(&self, accepts: bool) {
        self.peer_accepts_deltas
            .store(self.config.allow_deltas && accepts, Relaxed);
    }
}
