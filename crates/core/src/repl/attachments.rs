//! The attachment subprotocol: serving known blobs, proving possession, and
//! resolving the stubs of a pushed revision by challenge or download.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;

use tidegate_blip::{BlipMessage, OutgoingRequest, SenderClosed};

use crate::client::message_handlers::HandlerContext;
use crate::client::messages::{
    AttachmentMessage, PROFILE_GET_ATTACHMENT, PROFILE_PROVE_ATTACHMENT, PROP_COMPRESS, PROP_DIGEST,
};
use crate::client::SyncSession;
use crate::db::{attachment_digest, proof_of_attachment, StubAttachment, StubAttachmentResolver};
use crate::error::SyncError;
use crate::worker_metrics;

/// Serve a blob the pull side has announced. Digests outside the allowed
/// set are refused: a peer may only fetch what a revision offered it.
pub(crate) async fn handle_get_attachment(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
    response: &mut BlipMessage,
) -> Result<(), SyncError> {
    let params = AttachmentMessage::new(request);
    let digest = params.digest()?;
    if !ctx.session.is_attachment_allowed(digest) {
        return Err(SyncError::forbidden(format!(
            "attachment {digest:?} not announced to this peer"
        )));
    }
    let data = ctx.db.get_attachment(digest).await?;
    log::debug!(
        "#{}: [{}] sending attachment {digest:?} ({} bytes)",
        ctx.serial,
        ctx.session.peer_id(),
        data.len()
    );
    worker_metrics::ATTACHMENT_PULL_COUNT.inc();
    worker_metrics::ATTACHMENT_PULL_BYTES.inc_by(data.len() as u64);
    if params.compress()? {
        response.set_compressed(true);
    }
    response.set_body(data);
    Ok(())
}

/// Answer a peer's possession challenge: hash its nonce against our copy of
/// the blob and return the proof.
pub(crate) async fn handle_prove_attachment(
    ctx: &mut HandlerContext,
    request: &BlipMessage,
    response: &mut BlipMessage,
) -> Result<(), SyncError> {
    let digest = AttachmentMessage::new(request).digest()?;
    let nonce = request.body();
    if nonce.is_empty() {
        return Err(SyncError::bad_request("no nonce sent with proveAttachment"));
    }
    let data = ctx.db.get_attachment(digest).await?;
    let proof = proof_of_attachment(nonce, &data)?;
    log::debug!(
        "#{}: [{}] proving attachment {digest:?}",
        ctx.serial,
        ctx.session.peer_id()
    );
    response.set_body(proof.into_bytes());
    Ok(())
}

/// Resolves the stubs of one pushed revision against the pushing peer,
/// synchronously from within the `rev` handler.
///
/// Per stub: if we already hold the bytes, challenge the peer to prove it
/// has them too (otherwise a peer could link any blob whose digest it
/// guessed into its own document); if we don't, download and verify them.
pub(crate) struct PeerAttachmentResolver {
    session: Arc<SyncSession>,
    doc_id: String,
}

impl PeerAttachmentResolver {
    pub(crate) fn new(session: Arc<SyncSession>, doc_id: String) -> Self {
        Self { session, doc_id }
    }

    async fn verify(&self, stub: &StubAttachment, data: &Bytes) -> Result<(), SyncError> {
        let mut nonce = [0u8; 20];
        rand::rng().fill_bytes(&mut nonce);
        let expected = proof_of_attachment(&nonce, data)?;
        worker_metrics::ATTACHMENT_PROOFS_REQUESTED.inc();

        let mut msg = BlipMessage::request(PROFILE_PROVE_ATTACHMENT);
        msg.set_property(PROP_DIGEST, &stub.digest);
        msg.set_body(nonce.to_vec());
        let (request, reply) = OutgoingRequest::new(msg);
        if !self.session.send_blip_message(request) {
            return Err(SenderClosed.into());
        }
        let response = reply.recv().await?;
        if response.is_error() || response.body().as_ref() != expected.as_bytes() {
            return Err(SyncError::forbidden(format!(
                "peer failed to prove it has attachment {:?} of doc {:?}",
                stub.digest, self.doc_id
            )));
        }
        Ok(())
    }

    async fn download(&self, stub: &StubAttachment) -> Result<Bytes, SyncError> {
        let mut msg = BlipMessage::request(PROFILE_GET_ATTACHMENT);
        msg.set_property(PROP_DIGEST, &stub.digest);
        if wants_compression(stub.meta.content_type.as_deref()) {
            msg.set_property(PROP_COMPRESS, "true");
        }
        let (request, reply) = OutgoingRequest::new(msg);
        if !self.session.send_blip_message(request) {
            return Err(SenderClosed.into());
        }
        let mut response = reply.recv().await?;
        if response.is_error() {
            return Err(SyncError::internal(format!(
                "peer returned error {:?} for attachment {:?}",
                response.error_code(),
                stub.digest
            )));
        }
        let data = response.take_body();
        if data.len() as u64 != stub.meta.length {
            return Err(SyncError::bad_request(format!(
                "incorrect attachment size: expected {}, got {}",
                stub.meta.length,
                data.len()
            )));
        }
        if attachment_digest(&data) != stub.digest {
            return Err(SyncError::bad_request(format!(
                "incorrect attachment digest for {:?}",
                stub.digest
            )));
        }
        worker_metrics::ATTACHMENT_PUSH_COUNT.inc();
        worker_metrics::ATTACHMENT_PUSH_BYTES.inc_by(data.len() as u64);
        Ok(data)
    }
}

#[async_trait]
impl StubAttachmentResolver for PeerAttachmentResolver {
    async fn resolve(&mut self, stub: StubAttachment) -> Result<Option<Bytes>, SyncError> {
        match &stub.known_data {
            Some(data) => {
                self.verify(&stub, data).await?;
                Ok(None)
            }
            None => Ok(Some(self.download(&stub).await?)),
        }
    }
}

/// Already-compressed media gains nothing from frame compression.
fn wants_compression(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let ct = content_type.to_ascii_lowercase();
    !(ct.contains("zip")
        || ct.contains("gzip")
        || ct.contains("jpeg")
        || ct.contains("png")
        || ct.contains("gif")
        || ct.contains("webp")
        || ct.starts_with("video/")
        || ct.starts_with("audio/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests_utils::MockDb;
    use crate::db::AttachmentMeta;
    use crate::repl::test_support::mock_ctx;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    fn stub(digest: &str, known: Option<Bytes>, length: u64) -> StubAttachment {
        StubAttachment {
            name: "att".into(),
            digest: digest.into(),
            known_data: known,
            meta: AttachmentMeta {
                content_type: Some("text/plain".into()),
                length,
            },
        }
    }

    #[tokio::test]
    async fn get_attachment_requires_announcement() {
        let db = MockDb::new("db");
        let digest = db.insert_attachment(b"blob");
        let (mut ctx, _rx) = mock_ctx(&db);

        let mut request = BlipMessage::request(PROFILE_GET_ATTACHMENT);
        request.set_property(PROP_DIGEST, &digest);
        let mut response = BlipMessage::new();
        let err = handle_get_attachment(&mut ctx, &request, &mut response)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);

        ctx.session.add_allowed_attachments(&[digest.clone()]);
        let mut response = BlipMessage::new();
        handle_get_attachment(&mut ctx, &request, &mut response)
            .await
            .unwrap();
        assert_eq!(response.body().as_ref(), b"blob");
    }

    #[tokio::test]
    async fn get_attachment_opt_in_compression() {
        let db = MockDb::new("db");
        let digest = db.insert_attachment(b"blob");
        let (mut ctx, _rx) = mock_ctx(&db);
        ctx.session.add_allowed_attachments(&[digest.clone()]);

        let mut request = BlipMessage::request(PROFILE_GET_ATTACHMENT);
        request.set_property(PROP_DIGEST, &digest);
        request.set_property(PROP_COMPRESS, "true");
        let mut response = BlipMessage::new();
        handle_get_attachment(&mut ctx, &request, &mut response)
            .await
            .unwrap();
        assert!(response.compressed());
    }

    #[tokio::test]
    async fn prove_attachment_round_trip() {
        let db = MockDb::new("db");
        let digest = db.insert_attachment(b"proof-me");
        let (mut ctx, _rx) = mock_ctx(&db);

        let mut request = BlipMessage::request(PROFILE_PROVE_ATTACHMENT);
        request.set_property(PROP_DIGEST, &digest);
        request.set_body(&b"some-nonce"[..]);
        let mut response = BlipMessage::new();
        handle_prove_attachment(&mut ctx, &request, &mut response)
            .await
            .unwrap();
        let expected = proof_of_attachment(b"some-nonce", b"proof-me").unwrap();
        assert_eq!(response.body().as_ref(), expected.as_bytes());
    }

    #[tokio::test]
    async fn prove_attachment_requires_nonce() {
        let db = MockDb::new("db");
        let digest = db.insert_attachment(b"proof-me");
        let (mut ctx, _rx) = mock_ctx(&db);
        let mut request = BlipMessage::request(PROFILE_PROVE_ATTACHMENT);
        request.set_property(PROP_DIGEST, &digest);
        let mut response = BlipMessage::new();
        let err = handle_prove_attachment(&mut ctx, &request, &mut response)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn verification_accepts_a_correct_proof() {
        let db = MockDb::new("db");
        let (ctx, mut rx) = mock_ctx(&db);
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), "doc".into());
        let data = Bytes::from_static(b"known-bytes");
        let digest = attachment_digest(&data);

        let answer = tokio::spawn(async move {
            let challenge = rx.recv().await.unwrap();
            assert_eq!(challenge.message.profile(), PROFILE_PROVE_ATTACHMENT);
            let nonce = challenge.message.body().clone();
            let mut reply = BlipMessage::new();
            reply.set_body(
                proof_of_attachment(&nonce, b"known-bytes")
                    .unwrap()
                    .into_bytes(),
            );
            challenge.respond(reply);
        });

        let resolved = resolver
            .resolve(stub(&digest, Some(data), 11))
            .await
            .unwrap();
        assert_eq!(resolved, None);
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn verification_rejects_a_wrong_proof() {
        let db = MockDb::new("db");
        let (ctx, mut rx) = mock_ctx(&db);
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), "doc".into());
        let data = Bytes::from_static(b"known-bytes");
        let digest = attachment_digest(&data);

        tokio::spawn(async move {
            let challenge = rx.recv().await.unwrap();
            let mut reply = BlipMessage::new();
            reply.set_body(&b"liar"[..]);
            challenge.respond(reply);
        });

        let err = resolver
            .resolve(stub(&digest, Some(data), 11))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[tokio::test]
    async fn download_validates_length_and_digest() {
        let db = MockDb::new("db");
        let (ctx, mut rx) = mock_ctx(&db);
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), "doc".into());
        let data = Bytes::from_static(b"fresh-bytes");
        let digest = attachment_digest(&data);

        let serve = tokio::spawn(async move {
            let fetch = rx.recv().await.unwrap();
            assert_eq!(fetch.message.profile(), PROFILE_GET_ATTACHMENT);
            let mut reply = BlipMessage::new();
            reply.set_body(Bytes::from_static(b"fresh-bytes"));
            fetch.respond(reply);
        });

        let resolved = resolver
            .resolve(stub(&digest, None, data.len() as u64))
            .await
            .unwrap();
        assert_eq!(resolved, Some(data));
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn download_rejects_wrong_length() {
        let db = MockDb::new("db");
        let (ctx, mut rx) = mock_ctx(&db);
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), "doc".into());
        let digest = attachment_digest(b"fresh-bytes");

        tokio::spawn(async move {
            let fetch = rx.recv().await.unwrap();
            let mut reply = BlipMessage::new();
            reply.set_body(Bytes::from_static(b"fresh-bytes"));
            fetch.respond(reply);
        });

        let err = resolver
            .resolve(stub(&digest, None, 5))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn download_rejects_wrong_digest() {
        let db = MockDb::new("db");
        let (ctx, mut rx) = mock_ctx(&db);
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), "doc".into());

        tokio::spawn(async move {
            let fetch = rx.recv().await.unwrap();
            let mut reply = BlipMessage::new();
            reply.set_body(Bytes::from_static(b"other-bytes"));
            fetch.respond(reply);
        });

        let err = resolver
            .resolve(stub("sha1-not-it", None, 11))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn closed_transport_surfaces_as_sender_closed() {
        let db = MockDb::new("db");
        let (ctx, rx) = mock_ctx(&db);
        drop(rx);
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), "doc".into());
        let err = resolver
            .resolve(stub("sha1-any", None, 4))
            .await
            .unwrap_err();
        assert!(err.is_transport_closed());
    }

    #[test]
    fn compression_heuristic() {
        assert!(wants_compression(Some("text/plain")));
        assert!(wants_compression(Some("application/json")));
        assert!(wants_compression(None));
        assert!(!wants_compression(Some("image/jpeg")));
        assert!(!wants_compression(Some("application/zip")));
        assert!(!wants_compression(Some("video/mp4")));
    }

    #[tokio::test]
    async fn timeout_guard_for_unanswered_challenge() {
        // Dropping the request without responding resolves the reply future
        // with SenderClosed rather than hanging the rev handler.
        let db = MockDb::new("db");
        let (ctx, mut rx) = mock_ctx(&db);
        let mut resolver = PeerAttachmentResolver::new(ctx.session.clone(), "doc".into());
        let data = Bytes::from_static(b"known-bytes");
        let digest = attachment_digest(&data);

        tokio::spawn(async move {
            let challenge = rx.recv().await.unwrap();
            drop(challenge);
        });

        let err = timeout(
            Duration::from_secs(5),
            resolver.resolve(stub(&digest, Some(data), 11)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.is_transport_closed());
    }
}
