//! Connect/reconnect state machine around a [`ChatTransport`].

use crate::transport::{
    ChatEvent,
    ChatTransport,
    EventSink,
    TransportError,
};
use std::{
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);
pub const RETRY_MULTIPLIER: u32 = 2;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectError {
    #[error("cancelled while connecting")]
    Cancelled,
    #[error("giving up after {attempts} connection attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: TransportError },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_RETRY_DELAY, MAX_RETRY_DELAY)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; each call doubles the following
    /// one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(RETRY_MULTIPLIER).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Failed,
}

/// Owns the transport's connection. Runs as its own task: connects with
/// backoff, then waits for a reconnect request and starts over.
pub struct ConnectionSupervisor<T> {
    transport: Arc<T>,
    channel: String,
    events: EventSink,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
    max_attempts: Option<u32>,
}

impl<T: ChatTransport> ConnectionSupervisor<T> {
    pub fn new(transport: Arc<T>, channel: impl Into<String>, events: EventSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            channel: channel.into(),
            events,
            state,
            backoff: Backoff::default(),
            max_attempts: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// `0` means retry forever.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = (max_attempts > 0).then_some(max_attempts);
        self
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn connect_with_backoff(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        self.backoff.reset();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting { attempt });
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                result = self.transport.connect() => result,
            };

            match result {
                Ok(()) => {
                    self.transport.join(&self.channel);
                    self.state.send_replace(ConnectionState::Connected);
                    info!(attempt, channel = %self.channel, "connected");
                    // the receiver only goes away on shutdown
                    let _ = self.events.send(ChatEvent::Connected);
                    return Ok(());
                }
                Err(err) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        self.state.send_replace(ConnectionState::Failed);
                        error!(?err, attempt, "connection attempts exhausted");
                        return Err(ConnectError::AttemptsExhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let delay = self.backoff.next_delay();
                    warn!(?err, attempt, ?delay, "connect failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Runs until cancelled, the reconnect channel closes, or connecting fails
    /// for good.
    pub async fn run(
        mut self,
        mut reconnects: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
    ) -> Result<(), ConnectError> {
        let result = loop {
            match self.connect_with_backoff(&cancel).await {
                Ok(()) => {}
                Err(ConnectError::Cancelled) => break Ok(()),
                Err(err) => break Err(err),
            }
            // requests raised while reconnecting were about the old connection
            let stale = drain(&mut reconnects);
            if stale > 0 {
                debug!(stale, "dropped reconnect requests for the previous connection");
            }

            let requested = tokio::select! {
                _ = cancel.cancelled() => false,
                request = reconnects.recv() => request.is_some(),
            };
            if !requested {
                break Ok(());
            }
            let burst = drain(&mut reconnects);
            if burst > 0 {
                debug!(burst, "coalesced reconnect requests");
            }

            info!("reconnecting");
            if let Err(err) = self.transport.disconnect().await {
                warn!(?err, "disconnect before reconnect failed");
            }
        };

        if let Err(err) = self.transport.disconnect().await {
            warn!(?err, "disconnect on shutdown failed");
        }
        if result.is_ok() {
            self.state.send_replace(ConnectionState::Disconnected);
        }
        result
    }
}

/// Empties the queue, returning how many requests were waiting.
fn drain(reconnects: &mut mpsc::UnboundedReceiver<()>) -> usize {
    let mut drained = 0;
    while reconnects.try_recv().is_ok() {
        drained += 1;
    }
    drained
}
