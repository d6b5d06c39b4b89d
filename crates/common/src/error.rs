use thiserror::Error;

/// `Display` is intentionally short — it is the text
/// allowed onto an `error` frame or a close reason, never the place for
/// internal detail (causes go to `tracing`, not the wire).
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("auth rejected")]
    AuthRejected,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("tenant quota exceeded: {0}")]
    TenantQuotaExceeded(String),

    #[error("bus unavailable")]
    BusUnavailable,

    #[error("registry unavailable")]
    RegistryUnavailable,

    #[error("counter store unavailable")]
    CounterStoreUnavailable,

    #[error("slow consumer")]
    SlowConsumer,

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("internal error")]
    InternalError,

    #[error("not found")]
    NotFound,
}

impl RelayError {
    /// The short category string allowed onto an `error` frame.
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::AuthRejected => "auth_rejected",
            RelayError::InvalidFrame(_) => "invalid_frame",
            RelayError::TenantQuotaExceeded(_) => "tenant_quota_exceeded",
            RelayError::BusUnavailable => "bus_unavailable",
            RelayError::RegistryUnavailable => "registry_unavailable",
            RelayError::CounterStoreUnavailable => "counter_store_unavailable",
            RelayError::SlowConsumer => "slow_consumer",
            RelayError::HeartbeatTimeout => "heartbeat_timeout",
            RelayError::InternalError => "internal_error",
            RelayError::NotFound => "not_found",
        }
    }

    /// Terminal cases close the socket with an enumerated reason
    /// instead of sending an error frame and staying open.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayError::AuthRejected
                | RelayError::SlowConsumer
                | RelayError::HeartbeatTimeout
                | RelayError::InternalError
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
