//! The per-agent live connection (§4.5 "Write discipline").
//!
//! A single writer task owns the socket; every other task that wants to
//! push a message to the agent goes through the bounded send queue here
//! instead of touching the socket directly — concurrent writes to a single
//! WebSocket are undefined by the protocol.

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ids::short_id::ShortId;

/// A message destined for the agent's writer task.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Text(String),
    Close,
}

/// A live, authenticated agent session. Cheap to clone: the handle just
/// shares the send queue.
#[derive(Clone)]
pub struct AgentSession {
    pub agent_id: u64,
    pub agent_sid: ShortId,
    sender: mpsc::Sender<OutboundMessage>,
}

/// Error returned when a session's send queue is full or its writer task
/// has already exited.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send queue is full")]
    QueueFull,
    #[error("session is closed")]
    Closed,
}

impl AgentSession {
    /// Creates a session handle and the paired receiver the writer task
    /// should drain.
    pub fn new(agent_id: u64, agent_sid: ShortId, queue_depth: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::channel(queue_depth);
        (
            Self {
                agent_id,
                agent_sid,
                sender,
            },
            receiver,
        )
    }

    /// Enqueues a text frame without blocking. At-least-once, best-effort:
    /// callers (the sync engine) log failures and move on rather than
    /// treating them as API errors (§4.6 "Delivery semantics").
    pub fn try_send_text(&self, payload: String) -> std::result::Result<(), SendError> {
        self.sender
            .try_send(OutboundMessage::Text(payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Requests a graceful close of the writer task, used when the registry
    /// displaces this session with a newer connection for the same agent
    /// (§5 "Session registry").
    pub async fn close(&self) -> Result<()> {
        self.sender
            .send(OutboundMessage::Close)
            .await
            .map_err(|_| Error::internal("session writer task already exited"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::short_id::Prefix;

    #[tokio::test]
    async fn enqueued_text_is_observed_by_the_writer_side() {
        let (session, mut rx) = AgentSession::new(1, ShortId::generate_with(Prefix::Agent, || 1), 4);
        session.try_send_text("hello".into()).unwrap();
        match rx.recv().await.unwrap() {
            OutboundMessage::Text(t) => assert_eq!(t, "hello"),
            OutboundMessage::Close => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn full_queue_reports_queue_full_without_blocking() {
        let (session, _rx) = AgentSession::new(1, ShortId::generate_with(Prefix::Agent, || 1), 1);
        session.try_send_text("a".into()).unwrap();
        let err = session.try_send_text("b".into()).unwrap_err();
        assert!(matches!(err, SendError::QueueFull));
    }

    #[tokio::test]
    async fn close_after_receiver_dropped_reports_internal_error() {
        let (session, rx) = AgentSession::new(1, ShortId::generate_with(Prefix::Agent, || 1), 4);
        drop(rx);
        let err = session.close().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
