//! Scriptable in-memory [`SyncDatabase`] used by the protocol tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    attachment_digest, AttachmentMeta, Authenticator, ChangeEntry, ChangesOptions, ChangesSink,
    Document, JsonMap, RevDelta, RevDiff, SequenceId, StubAttachment, StubAttachmentResolver,
    SyncDatabase, UserChangeWaiter, UserPrincipal, BODY_ATTACHMENTS, BODY_REV,
};
use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct PutRecord {
    pub doc: Document,
    pub history: Vec<String>,
    pub no_conflicts: bool,
}

#[derive(Default)]
struct MockDbInner {
    name: String,
    allow_conflicts: AtomicBool,
    specials: Mutex<HashMap<(String, String), JsonMap>>,
    special_rev_counter: AtomicU64,
    docs: Mutex<HashMap<String, Document>>,
    doc_channels: Mutex<HashMap<String, HashSet<String>>>,
    forbidden_docs: Mutex<HashSet<String>>,
    attachments: Mutex<HashMap<String, Bytes>>,
    users: Mutex<HashMap<String, Arc<UserPrincipal>>>,
    waiter: Arc<MockWaiter>,
    change_batches: Mutex<VecDeque<Vec<ChangeEntry>>>,
    proposed_statuses: Mutex<HashMap<String, u64>>,
    deltas: Mutex<HashMap<(String, String, String), RevDelta>>,
    delta_failures: Mutex<HashSet<(String, String, String)>>,
    puts: Mutex<Vec<PutRecord>>,
    termination_notices: Mutex<Vec<String>>,
}

/// A user-bound view over the shared in-memory store.
pub struct MockDb {
    inner: Arc<MockDbInner>,
    user: Option<Arc<UserPrincipal>>,
}

impl MockDb {
    pub fn new(name: &str) -> Arc<Self> {
        let inner = MockDbInner {
            name: name.to_string(),
            allow_conflicts: AtomicBool::new(true),
            ..Default::default()
        };
        Arc::new(Self {
            inner: Arc::new(inner),
            user: None,
        })
    }

    pub fn set_allow_conflicts(&self, allow: bool) {
        self.inner.allow_conflicts.store(allow, SeqCst);
    }

    pub fn insert_doc(&self, doc: Document) {
        self.inner.docs.lock().insert(doc.id.clone(), doc);
    }

    pub fn set_doc_channels(&self, doc_id: &str, channels: impl IntoIterator<Item = String>) {
        self.inner
            .doc_channels
            .lock()
            .insert(doc_id.to_string(), channels.into_iter().collect());
    }

    pub fn forbid_doc(&self, doc_id: &str) {
        self.inner.forbidden_docs.lock().insert(doc_id.to_string());
    }

    /// Store `data` and return its digest.
    pub fn insert_attachment(&self, data: &[u8]) -> String {
        let digest = attachment_digest(data);
        self.inner
            .attachments
            .lock()
            .insert(digest.clone(), Bytes::copy_from_slice(data));
        digest
    }

    pub fn attachment(&self, digest: &str) -> Option<Bytes> {
        self.inner.attachments.lock().get(digest).cloned()
    }

    pub fn set_user_record(&self, user: UserPrincipal) {
        self.inner
            .users
            .lock()
            .insert(user.name.clone(), Arc::new(user));
    }

    /// Simulate an external mutation of a tracked principal.
    pub fn bump_user_counter(&self) {
        self.inner.waiter.count.fetch_add(1, SeqCst);
    }

    pub fn script_changes(&self, batches: Vec<Vec<ChangeEntry>>) {
        self.inner.change_batches.lock().extend(batches);
    }

    pub fn set_proposed_status(&self, doc_id: &str, status: u64) {
        self.inner
            .proposed_statuses
            .lock()
            .insert(doc_id.to_string(), status);
    }

    pub fn script_delta(&self, doc_id: &str, from: &str, to: &str, delta: RevDelta) {
        self.inner
            .deltas
            .lock()
            .insert((doc_id.into(), from.into(), to.into()), delta);
    }

    pub fn script_delta_failure(&self, doc_id: &str, from: &str, to: &str) {
        self.inner
            .delta_failures
            .lock()
            .insert((doc_id.into(), from.into(), to.into()));
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.inner.puts.lock().clone()
    }

    pub fn termination_notices(&self) -> Vec<String> {
        self.inner.termination_notices.lock().clone()
    }

    pub fn tracked_keys(&self) -> HashSet<String> {
        self.inner.waiter.keys.lock().clone()
    }
}

#[derive(Default)]
struct MockWaiter {
    count: AtomicU64,
    keys: Mutex<HashSet<String>>,
}

impl UserChangeWaiter for MockWaiter {
    fn count(&self) -> u64 {
        self.count.load(SeqCst)
    }

    fn set_tracked_keys(&self, keys: HashSet<String>) {
        *self.keys.lock() = keys;
    }
}

struct MockAuthenticator(Arc<MockDbInner>);

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn get_user(&self, name: &str) -> Result<Arc<UserPrincipal>, SyncError> {
        self.0
            .users
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("no such user {name:?}")))
    }
}

#[async_trait]
impl SyncDatabase for MockDb {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn user(&self) -> Option<Arc<UserPrincipal>> {
        self.user.clone()
    }

    fn with_user(&self, user: Option<Arc<UserPrincipal>>) -> Arc<dyn SyncDatabase> {
        Arc::new(MockDb {
            inner: self.inner.clone(),
            user,
        })
    }

    fn authenticator(&self) -> Arc<dyn Authenticator> {
        Arc::new(MockAuthenticator(self.inner.clone()))
    }

    fn user_change_waiter(&self) -> Arc<dyn UserChangeWaiter> {
        self.inner.waiter.clone()
    }

    fn allow_conflicts(&self) -> bool {
        self.inner.allow_conflicts.load(SeqCst)
    }

    fn create_zero_since_value(&self) -> SequenceId {
        SequenceId(0)
    }

    fn parse_sequence_id(&self, s: &str) -> Result<SequenceId, SyncError> {
        s.parse()
            .map(SequenceId)
            .map_err(|_| SyncError::bad_request(format!("invalid sequence {s:?}")))
    }

    fn notify_terminated_changes(&self, user_name: &str) {
        self.inner
            .termination_notices
            .lock()
            .push(user_name.to_string());
    }

    async fn get_special(&self, kind: &str, id: &str) -> Result<Option<JsonMap>, SyncError> {
        Ok(self
            .inner
            .specials
            .lock()
            .get(&(kind.to_string(), id.to_string()))
            .cloned())
    }

    async fn put_special(&self, kind: &str, id: &str, mut body: JsonMap) -> Result<String, SyncError> {
        let key = (kind.to_string(), id.to_string());
        let mut specials = self.inner.specials.lock();
        let supplied_rev = body.get(BODY_REV).and_then(Value::as_str).map(String::from);
        if let Some(existing) = specials.get(&key) {
            let current = existing.get(BODY_REV).and_then(Value::as_str);
            if current != supplied_rev.as_deref() {
                return Err(SyncError::conflict("checkpoint rev mismatch"));
            }
        } else if supplied_rev.is_some() {
            return Err(SyncError::conflict("checkpoint does not exist"));
        }
        let rev = format!("0-{}", self.inner.special_rev_counter.fetch_add(1, SeqCst) + 1);
        body.insert(BODY_REV.into(), Value::String(rev.clone()));
        specials.insert(key, body);
        Ok(rev)
    }

    async fn rev_diff(&self, doc_id: &str, revs: &[String]) -> RevDiff {
        let docs = self.inner.docs.lock();
        let Some(doc) = docs.get(doc_id) else {
            return RevDiff {
                missing: revs.to_vec(),
                possible_ancestors: Vec::new(),
            };
        };
        let known = |rev: &String| *rev == doc.rev_id || doc.history.contains(rev);
        if revs.iter().all(known) {
            return RevDiff::default();
        }
        RevDiff {
            missing: revs.iter().filter(|r| !known(r)).cloned().collect(),
            possible_ancestors: vec![doc.rev_id.clone()],
        }
    }

    async fn check_proposed_rev(&self, doc_id: &str, _rev: &str, _parent_rev: Option<&str>) -> u64 {
        self.inner
            .proposed_statuses
            .lock()
            .get(doc_id)
            .copied()
            .unwrap_or(0)
    }

    async fn get_rev(
        &self,
        doc_id: &str,
        rev_id: Option<&str>,
        _attachments_inline: bool,
        _ancestors: Option<&[String]>,
    ) -> Result<Document, SyncError> {
        if self.inner.forbidden_docs.lock().contains(doc_id) {
            return Err(SyncError::forbidden(format!("no access to {doc_id:?}")));
        }
        let docs = self.inner.docs.lock();
        let doc = docs
            .get(doc_id)
            .ok_or_else(|| SyncError::not_found(format!("missing doc {doc_id:?}")))?;
        if let Some(rev) = rev_id {
            if rev != doc.rev_id && !doc.history.contains(&rev.to_string()) {
                return Err(SyncError::not_found(format!("missing rev {doc_id:?}/{rev:?}")));
            }
        }
        Ok(doc.clone())
    }

    async fn put_existing_rev(
        &self,
        doc: Document,
        history: Vec<String>,
        no_conflicts: bool,
    ) -> Result<(), SyncError> {
        {
            let docs = self.inner.docs.lock();
            if let Some(existing) = docs.get(&doc.id) {
                let linked = history.contains(&existing.rev_id) || existing.rev_id == doc.rev_id;
                if no_conflicts && !linked {
                    return Err(SyncError::conflict("document update conflict"));
                }
            }
        }
        let mut stored = doc.clone();
        stored.history = history.iter().skip(1).cloned().collect();
        self.inner.docs.lock().insert(stored.id.clone(), stored);
        self.inner.puts.lock().push(PutRecord {
            doc,
            history,
            no_conflicts,
        });
        Ok(())
    }

    async fn get_delta(&self, doc_id: &str, from_rev: &str, to_rev: &str) -> Result<RevDelta, SyncError> {
        let key = (doc_id.to_string(), from_rev.to_string(), to_rev.to_string());
        if self.inner.delta_failures.lock().contains(&key) {
            return Err(SyncError::DeltaUnavailable);
        }
        Ok(self.inner.deltas.lock().get(&key).cloned().unwrap_or_default())
    }

    async fn get_attachment(&self, digest: &str) -> Result<Bytes, SyncError> {
        self.inner
            .attachments
            .lock()
            .get(digest)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("missing attachment {digest:?}")))
    }

    async fn for_each_stub_attachment(
        &self,
        body: &mut JsonMap,
        min_revpos: u64,
        resolver: &mut dyn StubAttachmentResolver,
    ) -> Result<(), SyncError> {
        let Some(Value::Object(attachments)) = body.get(BODY_ATTACHMENTS) else {
            return Ok(());
        };
        let mut stubs = Vec::new();
        for (name, meta) in attachments {
            if meta.get("stub").and_then(Value::as_bool) != Some(true) {
                continue;
            }
            if meta.get("revpos").and_then(Value::as_u64).unwrap_or(0) < min_revpos {
                continue;
            }
            let digest = meta
                .get("digest")
                .and_then(Value::as_str)
                .ok_or_else(|| SyncError::bad_request(format!("attachment {name:?} has no digest")))?;
            stubs.push(StubAttachment {
                name: name.clone(),
                digest: digest.to_string(),
                known_data: self.inner.attachments.lock().get(digest).cloned(),
                meta: AttachmentMeta {
                    content_type: meta
                        .get("content_type")
                        .and_then(Value::as_str)
                        .map(String::from),
                    length: meta.get("length").and_then(Value::as_u64).unwrap_or(0),
                },
            });
        }
        for stub in stubs {
            let digest = stub.digest.clone();
            if let Some(data) = resolver.resolve(stub).await? {
                self.inner.attachments.lock().insert(digest, data);
            }
        }
        Ok(())
    }

    async fn generate_sync_changes(
        &self,
        channels: HashSet<String>,
        options: ChangesOptions,
        doc_ids: Vec<String>,
        sink: &mut dyn ChangesSink,
    ) -> bool {
        loop {
            if options.terminator.is_fired() {
                return true;
            }
            let batch = self.inner.change_batches.lock().pop_front();
            match batch {
                Some(entries) => {
                    let doc_channels = self.inner.doc_channels.lock().clone();
                    let filtered = entries
                        .into_iter()
                        .filter(|entry| {
                            if !doc_ids.is_empty() && !doc_ids.contains(&entry.id) {
                                return false;
                            }
                            if channels.is_empty() {
                                return true;
                            }
                            doc_channels
                                .get(&entry.id)
                                .is_some_and(|chs| !chs.is_disjoint(&channels))
                        })
                        .collect();
                    if sink.on_changes(filtered).await.is_err() {
                        return true;
                    }
                }
                None => {
                    if sink.on_changes(Vec::new()).await.is_err() {
                        return true;
                    }
                    if !options.continuous {
                        return false;
                    }
                    options.terminator.fired().await;
                    return true;
                }
            }
        }
    }
}
