//! Token bucket gate in front of the transport.

use crate::transport::{
    ChatTransport,
    TransportError,
};
use std::{
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Longest a caller waits for a send token before the message is dropped.
pub const SAY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BUCKET_SIZE: usize = 20;
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SayError {
    #[error("timed out waiting for a send token")]
    Timeout,
    #[error("cancelled while waiting for a send token")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Bounded pool of send permits. Starts empty and gains one permit per refill
/// tick until it holds `capacity`.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    permits: Arc<Semaphore>,
    capacity: usize,
    refill_interval: Duration,
}

impl TokenBucket {
    pub fn new(capacity: usize, refill_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            capacity: capacity.max(1),
            refill_interval,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Adds one permit unless the bucket is already full; a tick on a full
    /// bucket is dropped.
    pub fn refill_once(&self) {
        if self.permits.available_permits() < self.capacity {
            self.permits.add_permits(1);
        }
    }

    pub fn spawn_refiller(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let bucket = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(bucket.refill_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // the first tick of `interval` completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => bucket.refill_once(),
                }
            }
            debug!("token refiller stopped");
        })
    }

    /// Takes one permit, giving up after `timeout` or when `cancel` fires.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), SayError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SayError::Cancelled),
            acquired = time::timeout(timeout, self.permits.acquire()) => match acquired {
                Ok(Ok(permit)) => {
                    permit.forget();
                    Ok(())
                }
                // the semaphore is never closed
                Ok(Err(_)) => Err(SayError::Cancelled),
                Err(_) => Err(SayError::Timeout),
            },
        }
    }
}

/// Sends through the transport only after taking a token from the bucket.
pub struct RateLimitedSender<T> {
    transport: Arc<T>,
    bucket: TokenBucket,
    timeout: Duration,
}

impl<T: ChatTransport> RateLimitedSender<T> {
    pub fn new(transport: Arc<T>, bucket: TokenBucket) -> Self {
        Self {
            transport,
            bucket,
            timeout: SAY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub async fn say(
        &self,
        channel: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SayError> {
        self.bucket.acquire(cancel, self.timeout).await?;
        self.transport.say(channel, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::RecordingTransport;

    #[tokio::test(start_paused = true)]
    async fn refiller__never_exceeds_capacity() {
        // given
        let bucket = TokenBucket::new(3, Duration::from_millis(100));
        let cancel = CancellationToken::new();

        // when
        let refiller = bucket.spawn_refiller(cancel.clone());
        time::sleep(Duration::from_secs(5)).await;

        // then
        assert_eq!(bucket.available(), 3);
        cancel.cancel();
        refiller.await.unwrap();
    }

    #[test]
    fn refill_once__drops_tick_when_full() {
        let bucket = TokenBucket::new(2, Duration::from_millis(100));
        assert_eq!(bucket.available(), 0);
        bucket.refill_once();
        bucket.refill_once();
        bucket.refill_once();
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire__times_out_on_empty_bucket() {
        // given
        let bucket = TokenBucket::new(1, Duration::from_millis(100));
        let cancel = CancellationToken::new();

        // when
        let result = bucket.acquire(&cancel, Duration::from_secs(30)).await;

        // then
        assert_eq!(result, Err(SayError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire__returns_cancelled_when_token_fires() {
        // given
        let bucket = TokenBucket::new(1, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let waiter = {
            let bucket = bucket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bucket.acquire(&cancel, SAY_TIMEOUT).await })
        };

        // when
        time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        // then
        assert_eq!(waiter.await.unwrap(), Err(SayError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn say__forwards_to_transport_after_refill() {
        // given
        let transport = Arc::new(RecordingTransport::default());
        let bucket = TokenBucket::new(2, Duration::from_millis(150));
        let cancel = CancellationToken::new();
        let _refiller = bucket.spawn_refiller(cancel.clone());
        let sender = RateLimitedSender::new(transport.clone(), bucket);

        // when
        sender.say("stream", "!bombs", &cancel).await.unwrap();

        // then
        assert_eq!(transport.sent_texts(), vec!["!bombs".to_string()]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn say__does_not_send_on_timeout() {
        // given
        let transport = Arc::new(RecordingTransport::default());
        let sender = RateLimitedSender::new(
            transport.clone(),
            TokenBucket::new(1, Duration::from_millis(150)),
        )
        .with_timeout(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        // when
        let result = sender.say("stream", "!slots", &cancel).await;

        // then
        assert_eq!(result, Err(SayError::Timeout));
        assert!(transport.sent_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn say__surfaces_transport_failure() {
        // given
        let transport = Arc::new(RecordingTransport::default());
        transport.set_connected(false);
        let bucket = TokenBucket::new(1, Duration::from_millis(150));
        bucket.refill_once();
        let sender = RateLimitedSender::new(transport.clone(), bucket);

        // when
        let result = sender.say("stream", "hi", &CancellationToken::new()).await;

        // then
        assert_eq!(result, Err(SayError::Transport(TransportError::Disconnected)));
    }
}
