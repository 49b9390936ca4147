use tokio::sync::oneshot;

use crate::message::BlipMessage;

/// Returned when a message is queued on, or a reply awaited from, a
/// connection that has already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("blip connection closed")]
pub struct SenderClosed;

/// A request queued for delivery, optionally paired with a reply slot the
/// transport fulfills when the peer's response arrives.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub message: BlipMessage,
    reply: Option<oneshot::Sender<BlipMessage>>,
}

impl OutgoingRequest {
    /// Pair `message` with a [`ReplyFuture`]. A `noReply` message gets no
    /// reply slot; its future resolves to [`SenderClosed`] if awaited.
    pub fn new(message: BlipMessage) -> (Self, ReplyFuture) {
        if message.no_reply() {
            let (_, rx) = oneshot::channel();
            (Self { message, reply: None }, ReplyFuture(rx))
        } else {
            let (tx, rx) = oneshot::channel();
            (
                Self {
                    message,
                    reply: Some(tx),
                },
                ReplyFuture(rx),
            )
        }
    }

    pub fn without_reply(mut message: BlipMessage) -> Self {
        message.set_no_reply(true);
        Self { message, reply: None }
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Deliver the peer's response. Dropping the request without responding
    /// resolves the paired future to [`SenderClosed`].
    pub fn respond(self, response: BlipMessage) {
        if let Some(tx) = self.reply {
            let _ = tx.send(response);
        }
    }
}

/// The pending response half of an [`OutgoingRequest`].
#[derive(Debug)]
pub struct ReplyFuture(oneshot::Receiver<BlipMessage>);

impl ReplyFuture {
    pub async fn recv(self) -> Result<BlipMessage, SenderClosed> {
        self.0.await.map_err(|_| SenderClosed)
    }
}

/// The outbound half of a connection, shared by every handler on a session.
pub trait BlipSender: Send + Sync {
    /// Queue `request` for delivery. Returns `false` iff the connection has
    /// closed; the message is dropped in that case.
    fn send(&self, request: OutgoingRequest) -> bool;
}

/// An inbound request as handed to the dispatcher, carrying the slot its
/// handler's response is written into. `reply` is `None` when the peer set
/// `noReply`.
#[derive(Debug)]
pub struct IncomingMessage {
    pub message: BlipMessage,
    reply: Option<oneshot::Sender<BlipMessage>>,
}

impl IncomingMessage {
    /// An inbound request expecting a response; the returned future is the
    /// transport's handle for shipping that response back.
    pub fn new(message: BlipMessage) -> (Self, ReplyFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                reply: Some(tx),
            },
            ReplyFuture(rx),
        )
    }

    pub fn without_reply(mut message: BlipMessage) -> Self {
        message.set_no_reply(true);
        Self { message, reply: None }
    }

    pub fn no_reply(&self) -> bool {
        self.reply.is_none() || self.message.no_reply()
    }

    pub fn profile(&self) -> &str {
        self.message.profile()
    }

    /// Ship `response` to the peer. A no-op for `noReply` messages.
    pub fn respond(self, response: BlipMessage) {
        if let Some(tx) = self.reply {
            let _ = tx.send(response);
        }
    }
}
