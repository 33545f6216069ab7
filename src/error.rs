//! Typed errors for the scheduling service's public surface.
//!
//! Internal plumbing (store, vault, runtime) uses `anyhow`; everything that
//! crosses the service boundary is folded into `ServiceError` so the
//! transport edge can map variants to HTTP statuses without string matching.

use crate::ratelimit::RateStatus;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("contact not found: {0}")]
    ContactNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("daily message cap reached ({}/{})", .0.sent_today, .0.daily_cap)]
    DailyCapReached(RateStatus),

    #[error("provider unavailable: {0}")]
    TransientProvider(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
