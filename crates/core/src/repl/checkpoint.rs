use serde_json::Value;

use tidegate_blip::BlipMessage;

use crate::client::message_handlers::HandlerContext;
use crate::client::messages::{CheckpointMessage, PROP_REV};
use crate::db::{BODY_ID, BODY_REV, SPECIAL_KIND_LOCAL};
use crate::error::SyncError;

const CHECKPOINT_DOC_PREFIX: &str = "checkpoint/";

/// Read the peer's checkpoint. The stored `_rev` moves into the response's
/// `rev` property; `_id` never leaves the store.
pub(crate) async fn handle_get_checkpoint(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
    response: &mut BlipMessage,
) -> Result<(), SyncError> {
    let client = CheckpointMessage::new(request).client()?;
    let key = format!("{CHECKPOINT_DOC_PREFIX}{client}");
    log::debug!(
        "#{}: [{}] getCheckpoint for client {client:?}",
        ctx.serial,
        ctx.session.peer_id()
    );
    let Some(mut body) = ctx.db.get_special(SPECIAL_KIND_LOCAL, &key).await? else {
        return Err(SyncError::not_found(format!("no checkpoint for client {client:?}")));
    };
    if let Some(Value::String(rev)) = body.remove(BODY_REV) {
        response.set_property(PROP_REV, rev);
    }
    body.remove(BODY_ID);
    response
        .set_json_body(&body)
        .map_err(|e| SyncError::internal(format!("encoding checkpoint body: {e}")))?;
    Ok(())
}

/// Write the peer's checkpoint, using the supplied `rev` for optimistic
/// concurrency. A conflicting write surfaces as the store's error.
pub(crate) async fn handle_set_checkpoint(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
    response: &mut BlipMessage,
) -> Result<(), SyncError> {
    let params = CheckpointMessage::new(request);
    let client = params.client()?;
    let key = format!("{CHECKPOINT_DOC_PREFIX}{client}");
    let body: Option<crate::db::JsonMap> = request.read_json_body()?;
    let Some(mut body) = body else {
        return Err(SyncError::bad_request("missing checkpoint body"));
    };
    match params.rev() {
        Some(rev) => {
            body.insert(BODY_REV.into(), Value::String(rev.into()));
        }
        None => {
            body.remove(BODY_REV);
        }
    }
    let new_rev = ctx.db.put_special(SPECIAL_KIND_LOCAL, &key, body).await?;
    log::debug!(
        "#{}: [{}] setCheckpoint for client {client:?} -> rev {new_rev:?}",
        ctx.serial,
        ctx.session.peer_id()
    );
    response.set_property(PROP_REV, new_rev);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::messages::{PROFILE_GET_CHECKPOINT, PROFILE_SET_CHECKPOINT, PROP_CLIENT};
    use crate::db::tests_utils::MockDb;
    use crate::repl::test_support::mock_ctx;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn set_request(client: &str, rev: Option<&str>, body: Value) -> BlipMessage {
        let mut msg = BlipMessage::request(PROFILE_SET_CHECKPOINT);
        msg.set_property(PROP_CLIENT, client);
        if let Some(rev) = rev {
            msg.set_property(PROP_REV, rev);
        }
        msg.set_json_body(&body).unwrap();
        msg
    }

    fn get_request(client: &str) -> BlipMessage {
        let mut msg = BlipMessage::request(PROFILE_GET_CHECKPOINT);
        msg.set_property(PROP_CLIENT, client);
        msg
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let db = MockDb::new("db");
        let (mut ctx, _rx) = mock_ctx(&db);

        let mut response = BlipMessage::new();
        handle_set_checkpoint(
            &mut ctx,
            &set_request("c1", None, json!({"lastSeq": "42"})),
            &mut response,
        )
        .await
        .unwrap();
        let rev = response.property(PROP_REV).unwrap().to_string();
        assert!(!rev.is_empty());

        let mut response = BlipMessage::new();
        handle_get_checkpoint(&mut ctx, &get_request("c1"), &mut response)
            .await
            .unwrap();
        assert_eq!(response.property(PROP_REV), Some(rev.as_str()));
        let body: Value = response.read_json_body().unwrap();
        assert_eq!(body, json!({"lastSeq": "42"}));
    }

    #[tokio::test]
    async fn get_missing_checkpoint_is_404() {
        let db = MockDb::new("db");
        let (mut ctx, _rx) = mock_ctx(&db);
        let mut response = BlipMessage::new();
        let err = handle_get_checkpoint(&mut ctx, &get_request("nobody"), &mut response)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn set_requires_a_body() {
        let db = MockDb::new("db");
        let (mut ctx, _rx) = mock_ctx(&db);
        let mut request = BlipMessage::request(PROFILE_SET_CHECKPOINT);
        request.set_property(PROP_CLIENT, "c1");
        let mut response = BlipMessage::new();
        let err = handle_set_checkpoint(&mut ctx, &request, &mut response)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn stale_rev_surfaces_store_conflict() {
        let db = MockDb::new("db");
        let (mut ctx, _rx) = mock_ctx(&db);

        let mut response = BlipMessage::new();
        handle_set_checkpoint(&mut ctx, &set_request("c1", None, json!({"n": 1})), &mut response)
            .await
            .unwrap();

        // A write carrying a rev that is no longer current must conflict.
        let mut response = BlipMessage::new();
        let err = handle_set_checkpoint(
            &mut ctx,
            &set_request("c1", Some("0-bogus"), json!({"n": 2})),
            &mut response,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 409);
    }
}
