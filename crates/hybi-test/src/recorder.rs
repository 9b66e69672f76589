//! A delegate that records every callback.

use std::time::Duration;

use bytes::Bytes;
use hybi_ws::{
    ConnectionId, Failure, FailureKind, HandshakeRequest, Message, Target, WebSocketDelegate,
    WebSocketServer,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::TestError;

/// One delegate callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// `on_accept`
    Accepted {
        /// Connection
        id: ConnectionId,
        /// Request path
        path: String,
    },
    /// `on_data`
    Data {
        /// Connection
        id: ConnectionId,
        /// The message
        message: Message,
    },
    /// `on_disconnect`
    Disconnected {
        /// Connection
        id: ConnectionId,
    },
    /// `on_failure`
    Failed {
        /// Connection
        id: ConnectionId,
        /// Failure stage
        kind: FailureKind,
        /// Unprocessed bytes
        raw: Bytes,
        /// Reason
        diagnostic: String,
    },
}

impl Recorded {
    /// The connection the callback was about.
    pub fn id(&self) -> ConnectionId {
        match self {
            Self::Accepted { id, .. }
            | Self::Data { id, .. }
            | Self::Disconnected { id }
            | Self::Failed { id, .. } => *id,
        }
    }
}

/// Records callbacks and lets tests wait for them.
///
/// Optionally greets each accepted connection and echoes data back.
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<Recorded>>,
    notify: Notify,
    greeting: Option<Message>,
    echo: bool,
}

impl RecordingDelegate {
    /// Creates a delegate that only records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `greeting` to every connection once it opens.
    #[must_use]
    pub fn with_greeting(mut self, greeting: impl Into<Message>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    /// Sends every received message back to its sender.
    #[must_use]
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Waits until `predicate` holds for the recorded events.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Result<Vec<Recorded>, TestError>
    where
        F: Fn(&[Recorded]) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let events = self.events.lock();
                    if predicate(&events) {
                        return events.clone();
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TestError::Timeout(timeout))
    }

    /// Waits for the first event matching `predicate`.
    pub async fn wait_for_event<F>(&self, timeout: Duration, predicate: F) -> Result<Recorded, TestError>
    where
        F: Fn(&Recorded) -> bool,
    {
        let events = self
            .wait_for(timeout, |events| events.iter().any(&predicate))
            .await?;
        events
            .into_iter()
            .find(|event| predicate(event))
            .ok_or(TestError::Timeout(timeout))
    }

    fn record(&self, event: Recorded) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

impl WebSocketDelegate for RecordingDelegate {
    fn on_accept(
        &self,
        _server: &WebSocketServer,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) -> Option<Message> {
        self.record(Recorded::Accepted {
            id,
            path: request.path().to_string(),
        });
        self.greeting.clone()
    }

    fn on_disconnect(&self, _server: &WebSocketServer, id: ConnectionId) {
        self.record(Recorded::Disconnected { id });
    }

    fn on_data(&self, server: &WebSocketServer, id: ConnectionId, message: Message) {
        if self.echo {
            server.send(message.clone(), Target::One(id));
        }
        self.record(Recorded::Data { id, message });
    }

    fn on_failure(&self, _server: &WebSocketServer, id: ConnectionId, failure: &Failure) {
        self.record(Recorded::Failed {
            id,
            kind: failure.kind,
            raw: failure.raw.clone(),
            diagnostic: failure.diagnostic.clone(),
        });
    }
}
