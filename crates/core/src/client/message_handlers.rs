use std::sync::Arc;

use tidegate_blip::{BlipMessage, IncomingMessage, ERROR_DOMAIN_HTTP};

use super::messages::*;
use super::session::SyncSession;
use crate::db::SyncDatabase;
use crate::error::SyncError;
use crate::repl;

/// The protocol verbs this gateway dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    GetCheckpoint,
    SetCheckpoint,
    SubChanges,
    Changes,
    ProposeChanges,
    Rev,
    NoRev,
    GetAttachment,
    ProveAttachment,
}

impl Verb {
    pub fn from_profile(profile: &str) -> Option<Self> {
        Some(match profile {
            PROFILE_GET_CHECKPOINT => Verb::GetCheckpoint,
            PROFILE_SET_CHECKPOINT => Verb::SetCheckpoint,
            PROFILE_SUB_CHANGES => Verb::SubChanges,
            PROFILE_CHANGES => Verb::Changes,
            PROFILE_PROPOSE_CHANGES => Verb::ProposeChanges,
            PROFILE_REV => Verb::Rev,
            PROFILE_NOREV => Verb::NoRev,
            PROFILE_GET_ATTACHMENT => Verb::GetAttachment,
            PROFILE_PROVE_ATTACHMENT => Verb::ProveAttachment,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::GetCheckpoint => PROFILE_GET_CHECKPOINT,
            Verb::SetCheckpoint => PROFILE_SET_CHECKPOINT,
            Verb::SubChanges => PROFILE_SUB_CHANGES,
            Verb::Changes => PROFILE_CHANGES,
            Verb::ProposeChanges => PROFILE_PROPOSE_CHANGES,
            Verb::Rev => PROFILE_REV,
            Verb::NoRev => PROFILE_NOREV,
            Verb::GetAttachment => PROFILE_GET_ATTACHMENT,
            Verb::ProveAttachment => PROFILE_PROVE_ATTACHMENT,
        }
    }

    /// Verbs that read or write user data run behind the permission-refresh
    /// interlock, bounding channel-grant staleness to one message.
    fn user_scoped(self) -> bool {
        matches!(
            self,
            Verb::SubChanges | Verb::Changes | Verb::Rev | Verb::GetAttachment
        )
    }
}

/// Per-message handler state. `db` starts as the session's current view and
/// is republished by the interlock when the user was refreshed.
pub(crate) struct HandlerContext {
    pub session: Arc<SyncSession>,
    pub db: Arc<dyn SyncDatabase>,
    pub serial: u64,
}

/// Entry point for one inbound message: resolve the verb, run the interlock
/// where required, execute the handler, and ship the paired response (or its
/// error encoding).
pub async fn dispatch(session: &Arc<SyncSession>, incoming: IncomingMessage) {
    let serial = session.increment_serial_number();
    let profile = incoming.profile().to_string();
    log::debug!("#{serial}: [{}] handling {profile:?}", session.peer_id());

    let db = session.copy_context_database().await;
    let mut ctx = HandlerContext {
        session: session.clone(),
        db,
        serial,
    };
    let mut response = BlipMessage::new();
    match route(&mut ctx, &incoming.message, &mut response).await {
        Ok(()) => {
            if ctx.session.config().show_handler && !incoming.no_reply() {
                response.set_property(PROP_HANDLER, &profile);
            }
        }
        Err(err) if err.is_transport_closed() => {
            log::debug!(
                "#{serial}: [{}] connection closed while handling {profile:?}",
                ctx.session.peer_id()
            );
            return;
        }
        Err(err) => {
            log::info!(
                "#{serial}: [{}] {profile:?} failed: {err}",
                ctx.session.peer_id()
            );
            response.set_error(ERROR_DOMAIN_HTTP, err.status(), &err.to_string());
        }
    }
    incoming.respond(response);
}

async fn route(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
    response: &mut BlipMessage,
) -> Result<(), SyncError> {
    let verb = Verb::from_profile(request.profile()).ok_or_else(|| {
        SyncError::not_found(format!("no handler for BLIP request profile {:?}", request.profile()))
    })?;
    if verb.user_scoped() {
        ctx.db = ctx.session.refresh_user().await?;
    }
    match verb {
        Verb::GetCheckpoint => repl::checkpoint::handle_get_checkpoint(ctx, request, response).await,
        Verb::SetCheckpoint => repl::checkpoint::handle_set_checkpoint(ctx, request, response).await,
        Verb::SubChanges => repl::pull::handle_sub_changes(ctx, request).await,
        Verb::Changes => repl::push::handle_changes(ctx, request, response).await,
        Verb::ProposeChanges => repl::push::handle_propose_changes(ctx, request, response).await,
        Verb::Rev => repl::push::handle_rev(ctx, request).await,
        Verb::NoRev => repl::push::handle_no_rev(ctx, request),
        Verb::GetAttachment => repl::attachments::handle_get_attachment(ctx, request, response).await,
        Verb::ProveAttachment => repl::attachments::handle_prove_attachment(ctx, request, response).await,
    }
}
