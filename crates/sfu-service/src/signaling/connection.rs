//! Outbound side of a signaling connection.
//!
//! Responses and notifications for a connection are queued on a bounded
//! channel drained by the socket writer. Responses wait for queue space;
//! notifications never block the sender (a room actor must not stall on a
//! slow client) and are dropped when the queue is full.

use super::protocol::{Notification, ServerMessage};
use crate::actors::metrics::{ActorType, MailboxMonitor};
use crate::observability::metrics as prom;
use common::types::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default outbound queue depth per connection.
pub const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// Handle used to send frames to one client.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

/// Receiving end of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    receiver: mpsc::Receiver<ServerMessage>,
    mailbox: Arc<MailboxMonitor>,
}

impl OutboundQueue {
    /// Next frame to write, or `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        let message = self.receiver.recv().await;
        if message.is_some() {
            self.mailbox.record_dequeue();
        }
        message
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        let message = self.receiver.try_recv().ok();
        if message.is_some() {
            self.mailbox.record_dequeue();
        }
        message
    }
}

impl ConnectionHandle {
    /// Create a connection handle and its outbound queue.
    #[must_use]
    pub fn channel(
        connection_id: ConnectionId,
        buffer: usize,
        cancel_token: CancellationToken,
    ) -> (Self, OutboundQueue) {
        let (sender, receiver) = mpsc::channel(buffer);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));

        let handle = Self {
            connection_id,
            sender,
            cancel_token,
            mailbox: Arc::clone(&mailbox),
        };

        (handle, OutboundQueue { receiver, mailbox })
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a response. Returns `false` if the connection is gone, in
    /// which case the response is discarded.
    pub async fn respond(&self, message: ServerMessage) -> bool {
        self.mailbox.record_enqueue();
        if self.sender.send(message).await.is_ok() {
            true
        } else {
            self.mailbox.record_dequeue();
            debug!(
                target: "sfu.signaling",
                connection_id = %self.connection_id,
                "Response discarded, connection closed"
            );
            false
        }
    }

    /// Queue a notification without waiting. Returns `false` if it was
    /// dropped.
    pub fn notify(&self, notification: Notification) -> bool {
        let event = notification.event_name();
        self.mailbox.record_enqueue();
        match self.sender.try_send(ServerMessage::from(notification)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_dequeue();
                self.mailbox.record_drop();
                prom::record_notification_dropped(event);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.mailbox.record_dequeue();
                false
            }
        }
    }

    /// Close the connection.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the outbound queue has been dropped (socket writer gone).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::ProducerId;
    use serde_json::json;

    fn closed_notification() -> Notification {
        Notification::TransportClosed {
            transport_id: common::types::TransportId::new(),
            reason: "dtls closed".to_string(),
        }
    }

    #[tokio::test]
    async fn test_respond_and_receive() {
        let (handle, mut queue) =
            ConnectionHandle::channel(ConnectionId::new(), 8, CancellationToken::new());

        assert!(handle.respond(ServerMessage::response(1, json!({}))).await);
        assert_eq!(handle.mailbox().current_depth(), 1);

        let message = queue.recv().await.unwrap();
        assert_eq!(message, ServerMessage::response(1, json!({})));
        assert_eq!(handle.mailbox().current_depth(), 0);
    }

    #[tokio::test]
    async fn test_notify_drops_when_full() {
        let (handle, mut queue) =
            ConnectionHandle::channel(ConnectionId::new(), 1, CancellationToken::new());

        assert!(handle.notify(closed_notification()));
        assert!(!handle.notify(closed_notification()));
        assert_eq!(handle.mailbox().messages_dropped(), 1);

        assert!(queue.try_recv().is_some());
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_after_queue_dropped() {
        let (handle, queue) =
            ConnectionHandle::channel(ConnectionId::new(), 8, CancellationToken::new());
        drop(queue);

        assert!(handle.is_closed());
        assert!(!handle.respond(ServerMessage::response(1, json!({}))).await);
        assert!(!handle.notify(Notification::NewProducer {
            producer_id: ProducerId::new(),
            peer_id: ConnectionId::new(),
            kind: common::media::MediaKind::Video,
        }));
        assert_eq!(handle.mailbox().messages_dropped(), 0);
    }

    #[test]
    fn test_cancel() {
        let token = CancellationToken::new();
        let (handle, _queue) = ConnectionHandle::channel(ConnectionId::new(), 8, token.clone());

        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(token.is_cancelled());
    }
}
