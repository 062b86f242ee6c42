//! Port to the chat service. Implementations push everything they receive into
//! a single [`EventSink`]; the bot consumes that channel from one task.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod stdio;

pub type EventSink = mpsc::UnboundedSender<ChatEvent>;
pub type EventStream = mpsc::UnboundedReceiver<ChatEvent>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChatMessage {
    pub channel: String,
    pub user_name: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(
        channel: impl Into<String>,
        user_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            user_name: user_name.into(),
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BanEvent {
    pub channel: String,
    pub user_name: String,
    /// `None` for a permanent ban.
    pub duration: Option<Duration>,
}

impl BanEvent {
    pub fn is_permanent(&self) -> bool {
        self.duration.is_none()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChatEvent {
    /// Emitted by the connection supervisor after a successful `connect`.
    Connected,
    Message(ChatMessage),
    Ban(BanEvent),
    /// The service asked us to reconnect.
    ReconnectRequested,
    /// The link dropped underneath us.
    Disconnected { reason: String },
    Notice { channel: String, message: String },
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    #[error("not connected")]
    Disconnected,
    #[error("transport i/o failed: {0}")]
    Io(String),
    #[error("message rejected: {0}")]
    Rejected(String),
}

pub trait ChatTransport: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to a channel. Joins are remembered across reconnects.
    fn join(&self, channel: &str);

    fn say(
        &self,
        channel: &str,
        message: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
