use std::sync::Arc;

use tokio::sync::mpsc;

use crate::sender::{BlipSender, OutgoingRequest};

/// A channel-backed [`BlipSender`] with no real socket behind it.
///
/// Tests (and any embedding that wants to drive the protocol in-process)
/// receive the queued requests on the paired receiver and answer them by
/// calling [`OutgoingRequest::respond`]. Dropping the receiver closes the
/// sender, after which `send` reports `false`.
pub fn channel_pair() -> (Arc<ChannelSender>, mpsc::UnboundedReceiver<OutgoingRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSender { tx }), rx)
}

pub struct ChannelSender {
    tx: mpsc::UnboundedSender<OutgoingRequest>,
}

impl BlipSender for ChannelSender {
    fn send(&self, request: OutgoingRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BlipMessage;

    #[tokio::test]
    async fn send_fails_after_receiver_drops() {
        let (sender, rx) = channel_pair();
        assert!(sender.send(OutgoingRequest::without_reply(BlipMessage::request("norev"))));
        drop(rx);
        assert!(!sender.send(OutgoingRequest::without_reply(BlipMessage::request("norev"))));
    }
}
