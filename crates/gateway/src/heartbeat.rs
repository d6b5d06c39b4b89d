//! `HeartbeatMonitor`: one background task per server instance,
//! reaping sessions whose registry record has gone stale and
//! periodically re-asserting the registry TTL for sessions that are
//! still heartbeating.

use chrono::{Duration as ChronoDuration, Utc};
use relay_registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::session::{CloseReason, SessionManager};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TTL_REASSERT_INTERVAL: Duration = Duration::from_secs(60);
const STALE_CUTOFF: ChronoDuration = ChronoDuration::seconds(90);

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { registry, sessions }
    }

    pub fn spawn(self: Arc<Self>) {
        let sweep = self.clone();
        tokio::spawn(async move { sweep.run_sweep_loop().await });
        let reassert = self;
        tokio::spawn(async move { reassert.run_ttl_reassert_loop().await });
    }

    /// Every 5 minutes: terminate sessions whose registry record is
    /// older than the 90s cutoff.
    async fn run_sweep_loop(&self) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let cutoff = Utc::now() - STALE_CUTOFF;
        let stale = match self.registry.list_stale(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "heartbeat sweep: registry unavailable, retrying next cycle");
                return;
            }
        };

        for session_id in stale {
            if let Some(session) = self.sessions.get(&session_id) {
                session.request_close(CloseReason::HeartbeatTimeout);
                info!(%session_id, "heartbeat timeout: session marked for termination");
            }
            // The registry record is removed by the session's own
            // teardown path once its reader/writer loop observes the
            // close request; no session locally registered here means
            // this instance never owned it (another instance's record).
        }
    }

    /// Every 60s, re-assert the TTL for sessions that received at least
    /// one client heartbeat since the last pass, so a quiet-but-healthy
    /// session doesn't get reaped between client heartbeats.
    async fn run_ttl_reassert_loop(&self) {
        let mut interval = tokio::time::interval(TTL_REASSERT_INTERVAL);
        loop {
            interval.tick().await;
            for session in self.sessions.sessions_needing_ttl_reassertion() {
                if let Err(e) = self.registry.heartbeat(&session.session_id).await {
                    warn!(error = %e, session_id = %session.session_id, "TTL reassertion failed");
                }
            }
        }
    }
}
