// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// The error taxonomy shared by every component of the runtime.
///
/// Classification is explicit — call sites branch on the variant (or the
/// predicates below), never on message strings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("Connection is readonly")]
    ReadonlyViolation,

    #[error("invalid approval: {0}")]
    InvalidApproval(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("provider error: {0}")]
    Provider(String),

    /// Resource pressure from the runtime itself.  Never retryable.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Transient fault (network blip, lock contention).  Retryable with
    /// backoff.
    #[error("transient error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` for faults that a jittered-backoff retry may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// `true` for resource-pressure faults that must NOT be retried.
    pub fn is_overloaded(&self) -> bool {
        matches!(self, Error::Overloaded(_))
    }

    /// Stable machine-readable kind string used in logs and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "notFound",
            Error::InvalidRequest(_) => "invalidRequest",
            Error::Conflict(_) => "conflict",
            Error::ReadonlyViolation => "readonlyViolation",
            Error::InvalidApproval(_) => "invalidApproval",
            Error::Timeout(_) => "timeout",
            Error::Provider(_) => "providerError",
            Error::Overloaded(_) => "overloaded",
            Error::Transient(_) => "transient",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<warren_store::StoreError> for Error {
    fn from(e: warren_store::StoreError) -> Self {
        Error::Internal(format!("storage: {e}"))
    }
}

impl From<warren_scheduler::ScheduleError> for Error {
    fn from(e: warren_scheduler::ScheduleError) -> Self {
        Error::InvalidRequest(format!("schedule: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(format!("malformed JSON: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ─── Unit tests ──────────────────────────────────────────────────────────────
