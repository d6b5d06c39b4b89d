//! `BusClient`: a connection-managed client to the external
//! NATS-compatible message bus. Wraps `async_nats::Client`, which
//! already re-establishes live subscriptions transparently on
//! reconnect (the NATS wire protocol re-sends `SUB` for every open
//! subscriber) — the connect-time backoff and publish-timeout behavior
//! here is layered on top of that.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use dashmap::DashMap;
use relay_common::RelayError;
use tracing::{info, instrument, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const PUBLISH_WAIT_BOUND: Duration = Duration::from_secs(5);

/// A handler invoked once per message on a matching subject. Must not
/// block — hand work to the session's outbound queue and return.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Connection-managed client to the external bus.
#[derive(Clone)]
pub struct BusClient {
    url: String,
    client: Arc<tokio::sync::RwLock<Option<Client>>>,
    dropped_publishes: Arc<AtomicU64>,
    handles: Arc<DashMap<u64, Arc<SubHandleInner>>>,
    next_handle_id: Arc<AtomicU64>,
}

struct SubHandleInner {
    cancelled: AtomicBool,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A live subscription. `unsubscribe` is idempotent and, once it
/// returns, guarantees no further handler invocations.
#[derive(Clone)]
pub struct SubHandle {
    id: u64,
    inner: Arc<SubHandleInner>,
    parent: Arc<DashMap<u64, Arc<SubHandleInner>>>,
}

impl SubHandle {
    pub async fn unsubscribe(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return; // already unsubscribed
        }
        self.parent.remove(&self.id);
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl BusClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Arc::new(tokio::sync::RwLock::new(None)),
            dropped_publishes: Arc::new(AtomicU64::new(0)),
            handles: Arc::new(DashMap::new()),
            next_handle_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Idempotent: establishes and maintains one logical connection,
    /// reconnecting with exponential backoff capped at 30s.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.client.read().await.is_some() {
            return Ok(());
        }

        let url = self.url.clone();
        let options = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(|attempts| {
                let exp = attempts.min(9) as u32; // 2^9 * 100ms ≈ 51s, clamp below
                let delay = INITIAL_BACKOFF.saturating_mul(1u32 << exp);
                delay.min(MAX_BACKOFF)
            })
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => warn!("bus disconnected"),
                    async_nats::Event::Connected => info!("bus connected"),
                    other => info!(?other, "bus event"),
                }
            });

        let client = options
            .connect(&url)
            .await
            .map_err(|_| RelayError::BusUnavailable)?;

        *self.client.write().await = Some(client);
        info!(url = %self.url, "bus client connected");
        Ok(())
    }

    /// `NotConnected` after waiting up to 5s for a healthy connection.
    #[instrument(skip(self, payload), fields(subject, len = payload.len()))]
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), RelayError> {
        let client = match self.wait_for_connection().await {
            Some(c) => c,
            None => {
                self.dropped_publishes.fetch_add(1, Ordering::Relaxed);
                return Err(RelayError::BusUnavailable);
            }
        };

        client
            .publish(subject.to_string(), payload.to_vec().into())
            .await
            .map_err(|_| RelayError::BusUnavailable)
    }

    /// Registers a handler invoked once per message on matching
    /// subjects. The handler must not block the dispatch path.
    #[instrument(skip(self, handler), fields(subject_pattern))]
    pub async fn subscribe(
        &self,
        subject_pattern: &str,
        handler: MessageHandler,
    ) -> Result<SubHandle, RelayError> {
        let client = self
            .wait_for_connection()
            .await
            .ok_or(RelayError::BusUnavailable)?;

        let mut subscriber = client
            .subscribe(subject_pattern.to_string())
            .await
            .map_err(|_| RelayError::BusUnavailable)?;

        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(SubHandleInner {
            cancelled: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(None),
        });

        let inner_for_task = inner.clone();
        let task = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(message) = subscriber.next().await {
                if inner_for_task.cancelled.load(Ordering::SeqCst) {
                    break;
                }
                handler(&message.subject, &message.payload);
            }
        });
        *inner.task.lock().await = Some(task);

        self.handles.insert(id, inner.clone());

        Ok(SubHandle {
            id,
            inner,
            parent: self.handles.clone(),
        })
    }

    pub fn dropped_publish_count(&self) -> u64 {
        self.dropped_publishes.load(Ordering::Relaxed)
    }

    async fn wait_for_connection(&self) -> Option<Client> {
        if let Some(c) = self.client.read().await.clone() {
            return Some(c);
        }
        let deadline = tokio::time::Instant::now() + PUBLISH_WAIT_BOUND;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            if let Some(c) = self.client.read().await.clone() {
                return Some(c);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        let compute = |attempts: usize| {
            let exp = attempts.min(9) as u32;
            INITIAL_BACKOFF.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
        };
        assert_eq!(compute(0), Duration::from_millis(100));
        assert_eq!(compute(20), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_without_connection_times_out_as_not_connected() {
        let bus = BusClient::new("nats://127.0.0.1:1"); // never connected
        let result = bus.publish("tenant.t1.events.x", b"{}").await;
        assert!(result.is_err());
        assert_eq!(bus.dropped_publish_count(), 1);
    }
}
