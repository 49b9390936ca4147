//! The protocol handlers: checkpoints, the pull and push engines, and the
//! attachment subprotocol.

pub mod attachments;
pub mod checkpoint;
pub mod pull;
pub mod push;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::client::message_handlers::HandlerContext;
    use crate::client::{SessionConfig, SessionHooks, SyncSession};
    use crate::db::tests_utils::MockDb;
    use crate::db::SyncDatabase;
    use tidegate_blip::{channel_pair, OutgoingRequest};

    pub(crate) fn ctx_for(
        db: Arc<dyn SyncDatabase>,
    ) -> (HandlerContext, mpsc::UnboundedReceiver<OutgoingRequest>) {
        ctx_with_config(db, SessionConfig::default(), SessionHooks::default())
    }

    pub(crate) fn ctx_with_config(
        db: Arc<dyn SyncDatabase>,
        config: SessionConfig,
        hooks: SessionHooks,
    ) -> (HandlerContext, mpsc::UnboundedReceiver<OutgoingRequest>) {
        let (sender, rx) = channel_pair();
        let session = SyncSession::new("test-peer", sender, db.clone(), config, hooks);
        (
            HandlerContext {
                session,
                db,
                serial: 1,
            },
            rx,
        )
    }

    pub(crate) fn mock_ctx(
        db: &Arc<MockDb>,
    ) -> (HandlerContext, mpsc::UnboundedReceiver<OutgoingRequest>) {
        let view: Arc<dyn SyncDatabase> = db.clone();
        ctx_for(view)
    }
}
