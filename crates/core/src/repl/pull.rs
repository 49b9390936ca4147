//! The pull engine: `subChanges` subscriptions, the change-feed batcher, and
//! the revision sender that answers the peer's per-row decisions.

use std::collections::HashSet;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use scopeguard::defer;
use serde_json::{json, Value};

use tidegate_blip::{BlipMessage, OutgoingRequest, ReplyFuture, SenderClosed};

use crate::client::message_handlers::HandlerContext;
use crate::client::messages::{
    SubChangesParams, CHANNEL_FILTER, PROFILE_CHANGES, PROFILE_NOREV, PROFILE_REV, PROP_DELETED,
    PROP_DELTAS, PROP_DELTA_SRC, PROP_ERROR, PROP_HISTORY, PROP_ID, PROP_REASON, PROP_REV,
    PROP_SEQUENCE,
};
use crate::client::session::SubscriptionParams;
use crate::client::SyncSession;
use crate::db::{ChangeEntry, ChangesOptions, ChangesSink, RevDelta, SyncDatabase, UserPrincipal};
use crate::error::SyncError;
use crate::util::panic_message;
use crate::worker_metrics;

/// Protocol entry for `subChanges`: validate, claim the session's single
/// feed slot, and spawn the feed task. Success is acknowledged by the
/// absence of an error.
pub(crate) async fn handle_sub_changes(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
) -> Result<(), SyncError> {
    let session = &ctx.session;
    if session.sub_changes_active() {
        return Err(SyncError::internal(
            "BLIP connection already has an outstanding continuous subChanges subscription",
        ));
    }
    let params = SubChangesParams::parse(request, ctx.db.as_ref(), session.config().default_batch_size)?;
    if !params.doc_ids.is_empty() && params.continuous {
        return Err(SyncError::bad_request(
            "docIDs filter not supported for continuous subChanges",
        ));
    }
    let channels = match params.filter.as_deref() {
        None => HashSet::new(),
        Some(CHANNEL_FILTER) => {
            if params.channels.is_empty() {
                return Err(SyncError::bad_request("missing 'channels' filter parameter"));
            }
            let expanded = expand_channels(ctx.db.user(), &params.channels);
            if expanded.is_empty() {
                return Err(SyncError::bad_request("empty channel list after access filtering"));
            }
            expanded
        }
        Some(other) => {
            return Err(SyncError::bad_request(format!("unknown filter {other:?}")));
        }
    };
    if params.future {
        log::debug!(
            "#{}: [{}] ignoring 'future' subChanges option",
            ctx.serial,
            session.peer_id()
        );
    }
    if !session.try_begin_sub_changes() {
        return Err(SyncError::internal(
            "BLIP connection already has an outstanding continuous subChanges subscription",
        ));
    }
    session.record_subscription(SubscriptionParams {
        batch_size: params.batch_size,
        continuous: params.continuous,
        active_only: params.active_only,
        channels: channels.clone(),
    });

    let active_gauge = if params.continuous {
        worker_metrics::PULL_REPLICATIONS_TOTAL_CONTINUOUS.inc();
        worker_metrics::PULL_REPLICATIONS_ACTIVE_CONTINUOUS.clone()
    } else {
        worker_metrics::PULL_REPLICATIONS_TOTAL_ONE_SHOT.inc();
        worker_metrics::PULL_REPLICATIONS_ACTIVE_ONE_SHOT.clone()
    };
    active_gauge.inc();

    log::info!(
        "#{}: [{}] subChanges since={} continuous={} batch={}",
        ctx.serial,
        session.peer_id(),
        params.since,
        params.continuous,
        params.batch_size
    );

    let session = session.clone();
    let db = ctx.db.clone();
    tokio::spawn(async move {
        defer! {
            session.end_sub_changes();
            active_gauge.dec();
        }
        let fut = send_changes(&session, &db, params, channels);
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            log::error!(
                "[{}] panic in change feed: {}\n{}",
                session.peer_id(),
                panic_message(panic.as_ref()),
                std::backtrace::Backtrace::force_capture()
            );
        }
    });
    Ok(())
}

/// Drive the change feed until the stream ends or the terminator fires.
async fn send_changes(
    session: &Arc<SyncSession>,
    db: &Arc<dyn SyncDatabase>,
    params: SubChangesParams,
    channels: HashSet<String>,
) {
    let user_name = session.user_name();
    let options = ChangesOptions {
        since: params.since,
        continuous: params.continuous,
        active_only: params.active_only,
        terminator: session.terminator().clone(),
    };
    let mut sink = ChangesSender {
        session: session.clone(),
        batch_size: params.batch_size,
        pending: Vec::new(),
        caught_up_sent: false,
    };
    let force_close = db
        .generate_sync_changes(channels, options, params.doc_ids, &mut sink)
        .await;
    if force_close && !user_name.is_empty() {
        db.notify_terminated_changes(&user_name);
    }
    log::debug!(
        "[{}] change feed exiting (forced_close={force_close})",
        session.peer_id()
    );
}

/// Accumulates protocol rows and ships them in `batch_size` chunks.
/// Owned by the feed task alone; no locking.
struct ChangesSender {
    session: Arc<SyncSession>,
    batch_size: usize,
    pending: Vec<Value>,
    caught_up_sent: bool,
}

#[async_trait]
impl ChangesSink for ChangesSender {
    async fn on_changes(&mut self, batch: Vec<ChangeEntry>) -> Result<(), SyncError> {
        if batch.is_empty() {
            // Caught up: flush whatever is pending, then signal once.
            if !self.pending.is_empty() {
                self.ship_pending().await?;
            }
            if !self.caught_up_sent {
                self.caught_up_sent = true;
                send_batch_of_changes(&self.session, Vec::new()).await?;
            }
            return Ok(());
        }
        for entry in batch {
            if entry.id.starts_with('_') {
                // Reserved namespace never replicates.
                continue;
            }
            for rev in &entry.revs {
                let row = if entry.deleted {
                    json!([entry.seq, entry.id, rev, true])
                } else {
                    json!([entry.seq, entry.id, rev])
                };
                self.pending.push(row);
                if self.pending.len() >= self.batch_size {
                    self.ship_pending().await?;
                }
            }
        }
        Ok(())
    }
}

impl ChangesSender {
    async fn ship_pending(&mut self) -> Result<(), SyncError> {
        let rows = mem::take(&mut self.pending);
        send_batch_of_changes(&self.session, rows).await
    }
}

/// Ship one `changes` message. Non-empty batches expect a reply, which a
/// spawned task matches back to revision sends; the empty caught-up signal
/// travels `noReply`.
async fn send_batch_of_changes(session: &Arc<SyncSession>, rows: Vec<Value>) -> Result<(), SyncError> {
    let mut msg = BlipMessage::request(PROFILE_CHANGES);
    msg.set_compressed(true);
    msg.set_json_body(&rows)
        .map_err(|e| SyncError::internal(format!("encoding changes batch: {e}")))?;
    worker_metrics::CHANGES_BATCHES_SENT.inc();
    worker_metrics::CHANGES_ROWS_SENT.inc_by(rows.len() as u64);

    if rows.is_empty() {
        if !session.send_blip_message(OutgoingRequest::without_reply(msg)) {
            return Err(SenderClosed.into());
        }
        log::debug!("[{}] sent caught-up signal", session.peer_id());
        return Ok(());
    }

    // Re-run the interlock so the response handler works against the
    // refreshed user, then snapshot that view for the task.
    let db = session.refresh_user().await?;
    let (request, reply) = OutgoingRequest::new(msg);
    if !session.send_blip_message(request) {
        return Err(SenderClosed.into());
    }
    log::debug!("[{}] sent {} change rows", session.peer_id(), rows.len());

    let session = session.clone();
    tokio::spawn(async move {
        let fut = handle_changes_response(&session, &db, rows, reply);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_transport_closed() => {
                log::debug!(
                    "[{}] changes response handler: connection closed",
                    session.peer_id()
                );
            }
            Ok(Err(err)) => {
                log::error!(
                    "[{}] changes response handler failed: {err}",
                    session.peer_id()
                );
            }
            Err(panic) => {
                log::error!(
                    "[{}] panic in changes response handler: {}\n{}",
                    session.peer_id(),
                    panic_message(panic.as_ref()),
                    std::backtrace::Backtrace::force_capture()
                );
            }
        }
    });
    Ok(())
}

/// Read the peer's per-row answers and send the revisions it asked for.
/// A numeric answer means "skip"; an array answer means "send it", with the
/// array contents being revisions the peer already has.
async fn handle_changes_response(
    session: &Arc<SyncSession>,
    db: &Arc<dyn SyncDatabase>,
    rows: Vec<Value>,
    reply: ReplyFuture,
) -> Result<(), SyncError> {
    let response = reply.recv().await?;
    if response.is_error() {
        log::info!(
            "[{}] peer rejected changes batch: error {:?}",
            session.peer_id(),
            response.error_code()
        );
        return Ok(());
    }
    if response.property(PROP_DELTAS) == Some("true") {
        session.set_peer_accepts_deltas(true);
    }
    let answers: Vec<Value> = response.read_json_body::<Option<Vec<Value>>>()?.unwrap_or_default();
    for (i, answer) in answers.iter().enumerate() {
        let Some(row) = rows.get(i) else { break };
        let Some(known) = answer.as_array() else {
            continue;
        };
        let known_revs: Vec<String> = known
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect();
        let (seq, doc_id, rev_id) = parse_change_row(row)?;
        send_revision(session, db, seq, doc_id, rev_id, &known_revs).await?;
    }
    Ok(())
}

/// The rows here are our own output, so failures are internal errors, not
/// peer faults.
fn parse_change_row(row: &Value) -> Result<(&Value, &str, &str), SyncError> {
    let arr = row
        .as_array()
        .filter(|a| a.len() >= 3)
        .ok_or_else(|| SyncError::internal("malformed change row"))?;
    let doc_id = arr[1]
        .as_str()
        .ok_or_else(|| SyncError::internal("malformed change row docID"))?;
    let rev_id = arr[2]
        .as_str()
        .ok_or_else(|| SyncError::internal("malformed change row revID"))?;
    Ok((&arr[0], doc_id, rev_id))
}

fn sequence_property(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Send one revision the peer asked for, as a delta against its newest known
/// rev when negotiated and available, else as a full body. Attachment
/// digests announced by the revision stay in the allowed set until the
/// exchange completes.
async fn send_revision(
    session: &Arc<SyncSession>,
    db: &Arc<dyn SyncDatabase>,
    seq: &Value,
    doc_id: &str,
    rev_id: &str,
    known_revs: &[String],
) -> Result<(), SyncError> {
    let mut doc = match db.get_rev(doc_id, Some(rev_id), true, Some(known_revs)).await {
        Ok(doc) => doc,
        Err(err @ (SyncError::NotFound(_) | SyncError::Forbidden(_))) => {
            return send_no_rev(session, doc_id, rev_id, &err).await;
        }
        Err(err) => return Err(err),
    };

    let mut delta: Option<(bytes::Bytes, String)> = None;
    if session.can_send_deltas() {
        if let Some(base) = known_revs.first() {
            worker_metrics::DELTAS_REQUESTED.inc();
            match db.get_delta(doc_id, base, rev_id).await {
                Ok(RevDelta {
                    redacted_rev: Some(redacted),
                    ..
                }) => {
                    // The peer may only see this revision redacted.
                    doc = redacted;
                }
                Ok(RevDelta {
                    delta: Some(bytes), ..
                }) => delta = Some((bytes, base.clone())),
                Ok(RevDelta { delta: None, .. }) => {}
                Err(SyncError::Forbidden(_)) | Err(SyncError::DeltaUnavailable) => {}
                Err(err) => return Err(err),
            }
        }
    }

    let mut msg = BlipMessage::request(PROFILE_REV);
    msg.set_compressed(true);
    msg.set_property(PROP_ID, doc_id);
    msg.set_property(PROP_REV, rev_id);
    msg.set_property(PROP_SEQUENCE, sequence_property(seq));
    if doc.deleted {
        msg.set_property(PROP_DELETED, "true");
    }
    if !doc.history.is_empty() {
        msg.set_property(PROP_HISTORY, doc.history.join(","));
    }
    match &delta {
        Some((bytes, base)) => {
            msg.set_property(PROP_DELTA_SRC, base.clone());
            msg.set_body(bytes.clone());
            worker_metrics::DELTAS_SENT.inc();
        }
        None => {
            msg.set_json_body(&doc.wire_body())
                .map_err(|e| SyncError::internal(format!("encoding revision body: {e}")))?;
        }
    }

    let digests = doc.attachment_digests();
    session.add_allowed_attachments(&digests);
    let (request, reply) = OutgoingRequest::new(msg);
    if !session.send_blip_message(request) {
        session.remove_allowed_attachments(&digests);
        return Err(SenderClosed.into());
    }
    worker_metrics::REV_SEND_COUNT.inc();

    if !digests.is_empty() {
        // The digests stay serveable until the peer has answered the rev,
        // since it may getAttachment them mid-exchange.
        let outcome = reply.recv().await;
        session.remove_allowed_attachments(&digests);
        if let Ok(resp) = outcome {
            if resp.is_error() {
                log::info!(
                    "[{}] peer rejected rev {doc_id:?}/{rev_id:?}: error {:?}",
                    session.peer_id(),
                    resp.error_code()
                );
            }
        }
    }
    Ok(())
}

async fn send_no_rev(
    session: &Arc<SyncSession>,
    doc_id: &str,
    rev_id: &str,
    err: &SyncError,
) -> Result<(), SyncError> {
    log::debug!(
        "[{}] sending norev for {doc_id:?}/{rev_id:?}: {err}",
        session.peer_id()
    );
    let mut msg = BlipMessage::request(PROFILE_NOREV);
    msg.set_property(PROP_ID, doc_id);
    msg.set_property(PROP_REV, rev_id);
    msg.set_property(PROP_ERROR, err.status().to_string());
    msg.set_property(PROP_REASON, err.to_string());
    worker_metrics::NOREV_SEND_COUNT.inc();
    if !session.send_blip_message(OutgoingRequest::without_reply(msg)) {
        return Err(SenderClosed.into());
    }
    Ok(())
}

/// Intersect the requested channels with the user's grants. `*` in the
/// request expands to everything the user can see; an absent user (admin)
/// passes the request through unfiltered.
fn expand_channels(user: Option<Arc<UserPrincipal>>, requested: &[String]) -> HashSet<String> {
    let Some(user) = user else {
        return requested.iter().cloned().collect();
    };
    let mut expanded = HashSet::new();
    for channel in requested {
        if channel == "*" {
            expanded.extend(user.channels.iter().filter(|c| *c != "*").cloned());
        } else if user.can_see_channel(channel) {
            expanded.insert(channel.clone());
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::messages::{PROFILE_SUB_CHANGES, PROP_BATCH, PROP_CHANNELS, PROP_CONTINUOUS, PROP_DOC_IDS, PROP_FILTER};
    use crate::db::SequenceId;
    use crate::db::tests_utils::MockDb;
    use crate::db::Document;
    use crate::repl::test_support::{ctx_for, mock_ctx};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn entry(seq: u64, id: &str, rev: &str) -> ChangeEntry {
        ChangeEntry {
            seq: SequenceId(seq),
            id: id.to_string(),
            revs: vec![rev.to_string()],
            deleted: false,
        }
    }

    fn sub_changes(batch: Option<&str>) -> BlipMessage {
        let mut msg = BlipMessage::request(PROFILE_SUB_CHANGES);
        if let Some(batch) = batch {
            msg.set_property(PROP_BATCH, batch);
        }
        msg
    }

    async fn next_changes_body(rx: &mut mpsc::UnboundedReceiver<OutgoingRequest>) -> Value {
        let req = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for changes message")
            .expect("transport closed");
        assert_eq!(req.message.profile(), PROFILE_CHANGES);
        req.message.read_json_body().unwrap()
    }

    async fn wait_feed_exit(session: &Arc<SyncSession>) {
        for _ in 0..500 {
            if !session.sub_changes_active() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("change feed never released the subscription gate");
    }

    #[tokio::test]
    async fn batches_rows_and_signals_caught_up_once() {
        let db = MockDb::new("db");
        db.script_changes(vec![vec![
            entry(1, "a", "1-a"),
            entry(2, "b", "1-b"),
            entry(3, "c", "1-c"),
        ]]);
        let (mut ctx, mut rx) = mock_ctx(&db);
        handle_sub_changes(&mut ctx, &sub_changes(Some("2"))).await.unwrap();

        assert_eq!(
            next_changes_body(&mut rx).await,
            json!([[1, "a", "1-a"], [2, "b", "1-b"]])
        );
        assert_eq!(next_changes_body(&mut rx).await, json!([[3, "c", "1-c"]]));
        assert_eq!(next_changes_body(&mut rx).await, json!([]));
        wait_feed_exit(&ctx.session).await;
    }

    #[tokio::test]
    async fn tombstones_and_reserved_ids() {
        let db = MockDb::new("db");
        let mut deleted = entry(4, "gone", "2-x");
        deleted.deleted = true;
        db.script_changes(vec![vec![entry(1, "_design/ignored", "1-d"), deleted]]);
        let (mut ctx, mut rx) = mock_ctx(&db);
        handle_sub_changes(&mut ctx, &sub_changes(None)).await.unwrap();

        // The reserved row is dropped; the tombstone row is four-element.
        assert_eq!(next_changes_body(&mut rx).await, json!([[4, "gone", "2-x", true]]));
        assert_eq!(next_changes_body(&mut rx).await, json!([]));
        wait_feed_exit(&ctx.session).await;
    }

    #[tokio::test]
    async fn second_sub_changes_is_an_application_error() {
        let db = MockDb::new("db");
        let (mut ctx, _rx) = mock_ctx(&db);
        let mut msg = sub_changes(None);
        msg.set_property(PROP_CONTINUOUS, "true");
        handle_sub_changes(&mut ctx, &msg).await.unwrap();
        let err = handle_sub_changes(&mut ctx, &msg).await.unwrap_err();
        assert_eq!(err.status(), 500);
        ctx.session.close();
        wait_feed_exit(&ctx.session).await;
    }

    #[tokio::test]
    async fn doc_ids_with_continuous_is_rejected() {
        let db = MockDb::new("db");
        let (mut ctx, _rx) = mock_ctx(&db);
        let mut msg = sub_changes(None);
        msg.set_property(PROP_CONTINUOUS, "true");
        msg.set_property(PROP_DOC_IDS, r#"["d1"]"#);
        let err = handle_sub_changes(&mut ctx, &msg).await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(!ctx.session.sub_changes_active());
    }

    #[tokio::test]
    async fn unknown_filter_is_rejected() {
        let db = MockDb::new("db");
        let (mut ctx, _rx) = mock_ctx(&db);
        let mut msg = sub_changes(None);
        msg.set_property(PROP_FILTER, "by_mood");
        let err = handle_sub_changes(&mut ctx, &msg).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn empty_expanded_channel_set_is_rejected() {
        let db = MockDb::new("db");
        db.set_user_record(UserPrincipal {
            name: "alice".into(),
            roles: vec![],
            channels: ["A".to_string()].into_iter().collect(),
        });
        let user = Arc::new(UserPrincipal {
            name: "alice".into(),
            roles: vec![],
            channels: ["A".to_string()].into_iter().collect(),
        });
        let view = db.with_user(Some(user));
        let (mut ctx, _rx) = ctx_for(view);
        let mut msg = sub_changes(None);
        msg.set_property(PROP_FILTER, CHANNEL_FILTER);
        msg.set_property(PROP_CHANNELS, "B");
        let err = handle_sub_changes(&mut ctx, &msg).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn peer_request_rows_trigger_revision_sends() {
        let db = MockDb::new("db");
        let mut doc = Document::new("a", "1-a");
        doc.body = json!({"x": 1}).as_object().unwrap().clone();
        db.insert_doc(doc);
        db.script_changes(vec![vec![entry(1, "a", "1-a")]]);
        let (mut ctx, mut rx) = mock_ctx(&db);
        handle_sub_changes(&mut ctx, &sub_changes(None)).await.unwrap();

        let changes = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(changes.message.profile(), PROFILE_CHANGES);
        let mut reply = BlipMessage::new();
        reply.set_json_body(&json!([[]])).unwrap();
        changes.respond(reply);

        // Skip the caught-up signal; the rev follows once the response
        // handler has run.
        loop {
            let req = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            match req.message.profile() {
                PROFILE_CHANGES => continue,
                PROFILE_REV => {
                    assert_eq!(req.message.property(PROP_ID), Some("a"));
                    assert_eq!(req.message.property(PROP_REV), Some("1-a"));
                    assert_eq!(req.message.property(PROP_SEQUENCE), Some("1"));
                    let body: Value = req.message.read_json_body().unwrap();
                    assert_eq!(body, json!({"x": 1}));
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        wait_feed_exit(&ctx.session).await;
    }

    #[tokio::test]
    async fn delta_send_after_negotiation() {
        let db = MockDb::new("db");
        let mut doc = Document::new("a", "2-b");
        doc.body = json!({"x": 2}).as_object().unwrap().clone();
        db.insert_doc(doc);
        db.script_delta(
            "a",
            "1-a",
            "2-b",
            RevDelta {
                delta: Some(bytes::Bytes::from_static(br#"{"x":[2]}"#)),
                redacted_rev: None,
            },
        );
        db.script_changes(vec![vec![entry(7, "a", "2-b")]]);
        let (mut ctx, mut rx) = mock_ctx(&db);
        handle_sub_changes(&mut ctx, &sub_changes(None)).await.unwrap();

        let changes = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let mut reply = BlipMessage::new();
        reply.set_property(PROP_DELTAS, "true");
        reply.set_json_body(&json!([["1-a"]])).unwrap();
        changes.respond(reply);

        loop {
            let req = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            match req.message.profile() {
                PROFILE_CHANGES => continue,
                PROFILE_REV => {
                    assert_eq!(req.message.property(PROP_DELTA_SRC), Some("1-a"));
                    assert_eq!(req.message.body().as_ref(), br#"{"x":[2]}"#);
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert!(ctx.session.can_send_deltas());
        wait_feed_exit(&ctx.session).await;
    }

    #[tokio::test]
    async fn missing_doc_becomes_norev() {
        let db = MockDb::new("db");
        db.script_changes(vec![vec![entry(9, "ghost", "1-g")]]);
        let (mut ctx, mut rx) = mock_ctx(&db);
        handle_sub_changes(&mut ctx, &sub_changes(None)).await.unwrap();

        let changes = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let mut reply = BlipMessage::new();
        reply.set_json_body(&json!([[]])).unwrap();
        changes.respond(reply);

        loop {
            let req = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            match req.message.profile() {
                PROFILE_CHANGES => continue,
                PROFILE_NOREV => {
                    assert_eq!(req.message.property(PROP_ID), Some("ghost"));
                    assert_eq!(req.message.property(PROP_ERROR), Some("404"));
                    assert!(req.message.no_reply());
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        wait_feed_exit(&ctx.session).await;
    }

    #[tokio::test]
    async fn terminator_stops_a_continuous_feed_and_notifies() {
        let db = MockDb::new("db");
        db.set_user_record(UserPrincipal {
            name: "alice".into(),
            roles: vec![],
            channels: ["A".to_string()].into_iter().collect(),
        });
        let user = Arc::new(UserPrincipal {
            name: "alice".into(),
            roles: vec![],
            channels: ["A".to_string()].into_iter().collect(),
        });
        let view = db.with_user(Some(user));
        let (mut ctx, mut rx) = ctx_for(view);
        let mut msg = sub_changes(None);
        msg.set_property(PROP_CONTINUOUS, "true");
        handle_sub_changes(&mut ctx, &msg).await.unwrap();

        // Feed drains the (empty) script, signals caught-up, then parks on
        // the terminator.
        assert_eq!(next_changes_body(&mut rx).await, json!([]));
        ctx.session.close();
        wait_feed_exit(&ctx.session).await;
        assert_eq!(db.termination_notices(), vec!["alice".to_string()]);
    }

    #[test]
    fn channel_expansion() {
        let user = Arc::new(UserPrincipal {
            name: "u".into(),
            roles: vec![],
            channels: ["A".to_string(), "B".to_string()].into_iter().collect(),
        });
        let expanded = expand_channels(Some(user.clone()), &["A".into(), "C".into()]);
        let want: HashSet<String> = ["A".to_string()].into_iter().collect();
        assert_eq!(expanded, want);
        let wildcard = expand_channels(Some(user), &["*".into()]);
        let want: HashSet<String> = ["A".to_string(), "B".to_string()].into_iter().collect();
        assert_eq!(wildcard, want);
        let admin = expand_channels(None, &["Z".into()]);
        let want: HashSet<String> = ["Z".to_string()].into_iter().collect();
        assert_eq!(admin, want);
    }
}
