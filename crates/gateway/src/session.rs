//! `SessionManager`: the instance-scoped arena that breaks the cyclic
//! reference a naive Session-holds-bus-subscription design would create.
//! Sessions live here keyed by `SessionId`; bus handlers (built in
//! `gateway.rs`) capture the id, not an `Arc<Session>`, and look the
//! entry up at delivery time, discarding the message if it is gone.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_bus::SubHandle;
use relay_common::{Principal, Role, SessionId, TenantId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::frames::OutboundFrame;

pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const MAX_SUBSCRIPTIONS_PER_SESSION_DEFAULT: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    AuthRejected,
    SlowConsumer,
    HeartbeatTimeout,
    InternalError,
}

impl CloseReason {
    /// Application close codes in the 4000-4999 private-use range
    /// (RFC 6455 section 7.4.2), paired with the reason string frame
    /// handlers and tests key off of.
    pub fn code_and_text(self) -> (u16, &'static str) {
        match self {
            CloseReason::ClientClosed => (1000, "normal"),
            CloseReason::AuthRejected => (4001, "auth-rejected"),
            CloseReason::SlowConsumer => (4002, "slow-consumer"),
            CloseReason::HeartbeatTimeout => (4003, "heartbeat-timeout"),
            CloseReason::InternalError => (4000, "internal-error"),
        }
    }
}

pub struct Session {
    pub session_id: SessionId,
    pub principal: Principal,
    pub tenant_id: TenantId,
    pub role: Role,
    pub server_instance_id: String,
    pub opened_at: DateTime<Utc>,
    pub max_subscriptions: u32,

    last_heartbeat_at: StdMutex<DateTime<Utc>>,
    heartbeat_since_sweep: AtomicBool,
    subscriptions: AsyncMutex<HashMap<String, SubHandle>>,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    closing: Notify,
    close_reason: StdMutex<Option<CloseReason>>,
}

impl Session {
    pub fn new(
        principal: Principal,
        role: Role,
        server_instance_id: String,
        max_subscriptions: u32,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let tenant_id = principal.tenant_id().clone();
        let now = Utc::now();
        let session = std::sync::Arc::new(Self {
            session_id: SessionId::new(),
            principal,
            tenant_id,
            role,
            server_instance_id,
            opened_at: now,
            max_subscriptions,
            last_heartbeat_at: StdMutex::new(now),
            heartbeat_since_sweep: AtomicBool::new(false),
            subscriptions: AsyncMutex::new(HashMap::new()),
            outbound_tx: tx,
            closing: Notify::new(),
            close_reason: StdMutex::new(None),
        });
        (session, rx)
    }

    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundFrame> {
        self.outbound_tx.clone()
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat_at.lock().unwrap() = Utc::now();
        self.heartbeat_since_sweep.store(true, Ordering::Relaxed);
    }

    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        *self.last_heartbeat_at.lock().unwrap()
    }

    /// Consumes the "heartbeat received since the last sweep" flag;
    /// used by `HeartbeatMonitor`'s 60s TTL-reassertion pass.
    pub fn take_heartbeat_since_sweep(&self) -> bool {
        self.heartbeat_since_sweep.swap(false, Ordering::Relaxed)
    }

    pub async fn subject_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    pub async fn has_subscription(&self, subject: &str) -> bool {
        self.subscriptions.lock().await.contains_key(subject)
    }

    pub async fn insert_subscription(&self, subject: String, handle: SubHandle) {
        self.subscriptions.lock().await.insert(subject, handle);
    }

    pub async fn remove_subscription(&self, subject: &str) -> Option<SubHandle> {
        self.subscriptions.lock().await.remove(subject)
    }

    /// Unsubscribes everything owned by this session. Called once,
    /// during teardown.
    pub async fn unsubscribe_all(&self) {
        let handles: Vec<SubHandle> = {
            let mut guard = self.subscriptions.lock().await;
            guard.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.unsubscribe().await;
        }
    }

    /// Requests termination with `reason`. Idempotent — first reason
    /// wins. Wakes the reader/writer tasks waiting on `wait_for_close`.
    pub fn request_close(&self, reason: CloseReason) {
        let mut guard = self.close_reason.lock().unwrap();
        if guard.is_none() {
            *guard = Some(reason);
            self.closing.notify_waiters();
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }

    pub async fn wait_for_close(&self) {
        self.closing.notified().await;
    }

    /// Non-blocking enqueue used both by the reader loop (acks/errors)
    /// and by bus handlers (inbound bus messages). Overflow is the
    /// slow-consumer trigger.
    pub fn try_enqueue(&self, frame: OutboundFrame) {
        match self.outbound_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.request_close(CloseReason::SlowConsumer);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!(session_id = %self.session_id, tenant_id = %self.tenant_id, "session dropped");
    }
}

/// Instance-scoped arena. Sessions are looked up by id, never passed
/// around as long-lived `Arc` clones outside of a single call.
#[derive(Default)]
pub struct SessionManager {
    arena: DashMap<SessionId, std::sync::Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: std::sync::Arc<Session>) {
        self.arena.insert(session.session_id, session);
    }

    pub fn get(&self, session_id: &SessionId) -> Option<std::sync::Arc<Session>> {
        self.arena.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<std::sync::Arc<Session>> {
        self.arena.remove(session_id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Sessions owned by this instance with at least one heartbeat since
    /// the last sweep — used by `HeartbeatMonitor`'s TTL reassertion.
    pub fn sessions_needing_ttl_reassertion(&self) -> Vec<std::sync::Arc<Session>> {
        self.arena
            .iter()
            .filter(|entry| entry.value().take_heartbeat_since_sweep())
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::{AgentId, AgentPrincipal};

    fn sample_principal() -> Principal {
        Principal::Agent(AgentPrincipal {
            agent_id: AgentId::new("a1"),
            tenant_id: TenantId::new("t1"),
        })
    }

    #[tokio::test]
    async fn overflowing_outbound_queue_requests_slow_consumer_close() {
        let (session, mut rx) = Session::new(sample_principal(), Role::Agent, "instance-a".into(), 128);
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            session.try_enqueue(OutboundFrame::Ack { id: None });
        }
        assert!(session.close_reason().is_none());
        session.try_enqueue(OutboundFrame::Ack { id: None });
        assert_eq!(session.close_reason(), Some(CloseReason::SlowConsumer));

        // Drain so the channel doesn't leak in the test.
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn session_manager_arena_round_trips() {
        let manager = SessionManager::new();
        let (session, _rx) = Session::new(sample_principal(), Role::Agent, "instance-a".into(), 128);
        let id = session.session_id;
        manager.insert(session);
        assert!(manager.get(&id).is_some());
        manager.remove(&id);
        assert!(manager.get(&id).is_none());
    }

    #[tokio::test]
    async fn subscribing_is_idempotent_in_the_subscription_map() {
        let (session, _rx) = Session::new(sample_principal(), Role::Agent, "instance-a".into(), 128);
        assert!(!session.has_subscription("tenant.t1.events.x").await);
    }
}
