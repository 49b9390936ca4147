//! The push engine: rev-diff answers for `changes`, status answers for
//! `proposeChanges`, and the `rev`/`norev` handlers that persist what the
//! peer sends.

use serde_json::{json, Value};

use tidegate_blip::BlipMessage;

use crate::client::message_handlers::HandlerContext;
use crate::client::messages::{
    RevMessage, PROP_DELTAS, PROP_ERROR, PROP_ID, PROP_REASON, PROP_REV,
};
use crate::db::{
    apply_delta, rev_generation, Document, JsonMap, BODY_ATTACHMENTS, BODY_DELETED, BODY_EXPIRY,
    BODY_ID, BODY_REV,
};
use crate::error::SyncError;
use crate::repl::attachments::PeerAttachmentResolver;
use crate::worker_metrics;

/// Answer a pushing peer's `changes` batch with, per row, `0` for known
/// revisions or the list of possible ancestors for wanted ones. Row order
/// mirrors the request; trailing zeros are elided.
pub(crate) async fn handle_changes(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
    response: &mut BlipMessage,
) -> Result<(), SyncError> {
    if !ctx.db.allow_conflicts() {
        return Err(SyncError::conflict(
            "changes not allowed on a no-conflict database; use proposeChanges",
        ));
    }
    let rows: Vec<Value> = request.read_json_body::<Option<Vec<Value>>>()?.unwrap_or_default();
    log::debug!(
        "#{}: [{}] peer pushed {} change rows",
        ctx.serial,
        ctx.session.peer_id(),
        rows.len()
    );
    let mut output: Vec<Value> = Vec::with_capacity(rows.len());
    let mut wanted_seqs = Vec::new();
    for row in &rows {
        let (seq, doc_id, rev_id) = parse_pushed_row(row)?;
        let diff = ctx.db.rev_diff(doc_id, &[rev_id.to_string()]).await;
        if diff.missing.is_empty() {
            output.push(json!(0));
        } else {
            wanted_seqs.push(sequence_string(seq));
            output.push(json!(diff.possible_ancestors));
        }
    }
    while output.last() == Some(&json!(0)) {
        output.pop();
    }
    if let Some(hook) = &ctx.session.hooks().post_handle_changes {
        hook(wanted_seqs);
    }
    response.set_compressed(true);
    response
        .set_json_body(&output)
        .map_err(|e| SyncError::internal(format!("encoding changes response: {e}")))?;
    Ok(())
}

/// Answer a no-conflicts peer's `proposeChanges` batch. Only non-zero
/// statuses are materialized: the output forward-pads with zeros up to each
/// non-zero status's row index, so trailing zeros never appear.
pub(crate) async fn handle_propose_changes(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
    response: &mut BlipMessage,
) -> Result<(), SyncError> {
    let rows: Vec<Value> = request.read_json_body::<Option<Vec<Value>>>()?.unwrap_or_default();
    let mut output: Vec<Value> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let arr = row
            .as_array()
            .filter(|a| a.len() >= 2)
            .ok_or_else(|| SyncError::bad_request("malformed proposeChanges row"))?;
        let doc_id = arr[0]
            .as_str()
            .ok_or_else(|| SyncError::bad_request("malformed proposeChanges docID"))?;
        let rev_id = arr[1]
            .as_str()
            .ok_or_else(|| SyncError::bad_request("malformed proposeChanges revID"))?;
        let parent_rev = arr.get(2).and_then(Value::as_str);
        let status = ctx.db.check_proposed_rev(doc_id, rev_id, parent_rev).await;
        if status != 0 {
            while output.len() < i {
                output.push(json!(0));
            }
            output.push(json!(status));
        }
    }
    if ctx.session.deltas_enabled() {
        response.set_property(PROP_DELTAS, "true");
    }
    response.set_compressed(true);
    response
        .set_json_body(&output)
        .map_err(|e| SyncError::internal(format!("encoding proposeChanges response: {e}")))?;
    Ok(())
}

/// Persist one pushed revision: apply the delta when the peer sent one,
/// extract the expiry, resolve stub attachments, and write through
/// `put_existing_rev`.
pub(crate) async fn handle_rev(ctx: &mut HandlerContext, request: &BlipMessage) -> Result<(), SyncError> {
    let adapter = RevMessage::new(request);
    let doc_id = adapter.id()?.to_string();
    let rev_id = adapter.rev()?.to_string();
    log::debug!(
        "#{}: [{}] inserting rev {doc_id:?}/{rev_id:?}",
        ctx.serial,
        ctx.session.peer_id()
    );

    let mut doc = Document::new(&doc_id, &rev_id);
    doc.deleted = adapter.deleted()?;

    let mut injected_attachments = false;
    let mut body: JsonMap;
    if let Some(delta_src) = adapter.delta_src() {
        if !ctx.session.deltas_enabled() {
            return Err(SyncError::bad_request("deltas are disabled for this database"));
        }
        // Access-checked read: a cache hit must not bypass the user's grants.
        let src = ctx.db.get_rev(&doc_id, Some(delta_src), false, None).await?;
        if src.deleted {
            return Err(SyncError::not_found(format!(
                "can't apply delta: {doc_id:?}/{delta_src:?} is a tombstone"
            )));
        }
        let mut base = src.body.clone();
        if !src.attachments.is_empty() {
            base.insert(BODY_ATTACHMENTS.into(), Value::Object(src.attachments.clone()));
            injected_attachments = true;
        }
        let patch: Value = serde_json::from_slice(request.body())
            .map_err(|e| SyncError::internal(format!("invalid delta body: {e}")))?;
        apply_delta(&mut base, &patch)?;
        worker_metrics::DELTA_PUSH_COUNT.inc();
        body = base;
    } else if request.body().is_empty() {
        body = JsonMap::new();
    } else {
        let value: Value = serde_json::from_slice(request.body())
            .map_err(|e| SyncError::internal(format!("invalid revision body: {e}")))?;
        body = value
            .as_object()
            .cloned()
            .ok_or_else(|| SyncError::internal("revision body is not a JSON object"))?;
    }

    if let Some(deleted) = body.remove(BODY_DELETED) {
        if deleted.as_bool() == Some(true) {
            doc.deleted = true;
        }
    }
    body.remove(BODY_ID);
    body.remove(BODY_REV);
    if let Some(expiry) = body.remove(BODY_EXPIRY) {
        doc.expiry = Some(expiry);
    }

    let mut history = vec![rev_id.clone()];
    history.extend(adapter.history());
    // Attachments at or above the oldest ancestor's generation are new to
    // us and must be resolved; older ones were validated on a prior push.
    let min_revpos = history.last().map(|r| rev_generation(r) + 1).unwrap_or(0);

    if injected_attachments || body.contains_key(BODY_ATTACHMENTS) {
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), doc_id.clone());
        ctx.db
            .for_each_stub_attachment(&mut body, min_revpos, &mut resolver)
            .await?;
    }
    if let Some(Value::Object(attachments)) = body.remove(BODY_ATTACHMENTS) {
        doc.attachments = attachments;
    }
    doc.body = body;

    let no_conflicts = !ctx.db.allow_conflicts() || adapter.no_conflicts()?;
    ctx.db.put_existing_rev(doc, history, no_conflicts).await?;
    worker_metrics::REV_PUSH_COUNT.inc();

    if let Some(hook) = &ctx.session.hooks().post_handle_rev {
        if let Some(seq) = adapter.sequence() {
            hook(seq.to_string());
        }
    }
    Ok(())
}

/// The peer announced it cannot send a revision we asked for. Log only; the
/// dispatcher handles the optional diagnostic acknowledgement.
pub(crate) fn handle_no_rev(ctx: &mut HandlerContext, request: &BlipMessage) -> Result<(), SyncError> {
    log::info!(
        "#{}: [{}] peer withheld rev {:?}/{:?}: error={:?} reason={:?}",
        ctx.serial,
        ctx.session.peer_id(),
        request.property(PROP_ID).unwrap_or(""),
        request.property(PROP_REV).unwrap_or(""),
        request.property(PROP_ERROR).unwrap_or(""),
        request.property(PROP_REASON).unwrap_or("")
    );
    Ok(())
}

fn parse_pushed_row(row: &Value) -> Result<(&Value, &str, &str), SyncError> {
    let arr = row
        .as_array()
        .filter(|a| a.len() >= 3)
        .ok_or_else(|| SyncError::bad_request("malformed change row"))?;
    let doc_id = arr[1]
        .as_str()
        .ok_or_else(|| SyncError::bad_request("malformed change row docID"))?;
    let rev_id = arr[2]
        .as_str()
        .ok_or_else(|| SyncError::bad_request("malformed change row revID"))?;
    Ok((&arr[0], doc_id, rev_id))
}

fn sequence_string(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
