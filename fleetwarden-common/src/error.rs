use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FleetError {
    /// Network, timeout or rate limiting. Retried with backoff by the caller.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Quota exceeded, invalid spec. Never retried.
    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    #[error("stale data: {0}")]
    StaleData(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("failover session already active for primary {0}")]
    ConcurrentSession(Uuid),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Request body or parameters the API cannot parse.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl FleetError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::TransientProvider(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            FleetError::TransientProvider(_) => "transient_provider_error",
            FleetError::PermanentProvider(_) => "permanent_provider_error",
            FleetError::StaleData(_) => "stale_data",
            FleetError::PolicyViolation(_) => "policy_violation",
            FleetError::ConcurrentSession(_) => "concurrent_session",
            FleetError::NotFound(_) => "not_found",
            FleetError::Cancelled(_) => "cancelled",
            FleetError::InvalidRequest(_) => "invalid_request",
            FleetError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}
