//! Error taxonomy for the gitvan core.
//!
//! Failures are classified by [`ErrorKind`] so receipts, logs, and the retry
//! policy all agree on what happened. Structured errors are raised as
//! [`GitvanError`] and propagated with `anyhow`; the kind survives wrapping
//! and can be recovered from a cause chain with [`ErrorKind::classify`].
//! Only network trouble and rate limiting are retryable - every logical
//! failure (bad manifest, conflict, traversal attempt) is permanent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, recorded in receipts as `error.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Input errors
    ManifestInvalid,
    PackIdInvalid,
    InputValidationFailed,
    PathTraversal,
    TemplateInjection,
    // Resolution errors
    PackNotFound,
    DependencyFailed,
    CycleDetected,
    Conflict,
    VersionConstraintUnsatisfied,
    // Fetch errors
    NetworkError,
    AuthError,
    RateLimited,
    IntegrityMismatch,
    // Execution errors
    GitError,
    TemplateRenderError,
    FileSystemError,
    JobTimeout,
    PoolClosed,
    // State errors
    AlreadyApplied,
    ReceiptWriteFailed,
    // Anything that reached a boundary without a structured cause.
    Other,
}

impl ErrorKind {
    /// Transient kinds are retried with bounded backoff; everything else
    /// surfaces immediately.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::NetworkError | ErrorKind::RateLimited)
    }

    /// Recover the kind from an `anyhow` chain. Walks the causes looking for
    /// a [`GitvanError`]; unstructured errors classify as [`ErrorKind::Other`].
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<GitvanError>() {
                return e.kind();
            }
            if cause.downcast_ref::<reqwest::Error>().is_some() {
                return ErrorKind::NetworkError;
            }
            if cause.downcast_ref::<std::io::Error>().is_some() {
                return ErrorKind::FileSystemError;
            }
        }
        ErrorKind::Other
    }
}

/// Structured error for every failure kind the core raises itself.
#[derive(Debug, Error)]
pub enum GitvanError {
    #[error("invalid pack manifest: {reason}")]
    ManifestInvalid { reason: String },

    #[error("invalid pack id {id:?}")]
    PackIdInvalid { id: String },

    #[error("input {name:?} failed validation: {reason}")]
    InputValidationFailed { name: String, reason: String },

    #[error("path {path:?} escapes the target directory")]
    PathTraversal { path: String },

    #[error("input {name:?} contains template syntax")]
    TemplateInjection { name: String },

    #[error("pack not found: {id}")]
    PackNotFound { id: String },

    #[error("failed to resolve dependency of {pack_id}: {cause}")]
    DependencyFailed { pack_id: String, cause: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("packs {a} and {b} conflict: {reason}")]
    Conflict { a: String, b: String, reason: String },

    #[error("{pack_id}@{version} does not satisfy {constraint:?} required by {required_by}")]
    VersionConstraintUnsatisfied {
        pack_id: String,
        version: String,
        constraint: String,
        required_by: String,
    },

    #[error("network error: {message}")]
    NetworkError { message: String },

    #[error("authentication failed for {host}")]
    AuthError { host: String },

    #[error("rate limited by {host}; window resets in {reset_secs}s")]
    RateLimited { host: String, reset_secs: u64 },

    #[error("integrity mismatch for {subject}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("git {command} exited with {exit_code}: {stderr}")]
    GitError {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("template render failed for {template}: {reason}")]
    TemplateRenderError { template: String, reason: String },

    #[error("filesystem error at {path}: {message}")]
    FileSystemError { path: String, message: String },

    #[error("job {job_id} timed out after {timeout_ms}ms")]
    JobTimeout { job_id: String, timeout_ms: u64 },

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("pack {id} already applied (fingerprint {fingerprint})")]
    AlreadyApplied { id: String, fingerprint: String },

    #[error("failed to write receipt for {commit}: {reason}")]
    ReceiptWriteFailed { commit: String, reason: String },
}

impl GitvanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GitvanError::ManifestInvalid { .. } => ErrorKind::ManifestInvalid,
            GitvanError::PackIdInvalid { .. } => ErrorKind::PackIdInvalid,
            GitvanError::InputValidationFailed { .. } => ErrorKind::InputValidationFailed,
            GitvanError::PathTraversal { .. } => ErrorKind::PathTraversal,
            GitvanError::TemplateInjection { .. } => ErrorKind::TemplateInjection,
            GitvanError::PackNotFound { .. } => ErrorKind::PackNotFound,
            GitvanError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            GitvanError::CycleDetected { .. } => ErrorKind::CycleDetected,
            GitvanError::Conflict { .. } => ErrorKind::Conflict,
            GitvanError::VersionConstraintUnsatisfied { .. } => {
                ErrorKind::VersionConstraintUnsatisfied
            }
            GitvanError::NetworkError { .. } => ErrorKind::NetworkError,
            GitvanError::AuthError { .. } => ErrorKind::AuthError,
            GitvanError::RateLimited { .. } => ErrorKind::RateLimited,
            GitvanError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            GitvanError::GitError { .. } => ErrorKind::GitError,
            GitvanError::TemplateRenderError { .. } => ErrorKind::TemplateRenderError,
            GitvanError::FileSystemError { .. } => ErrorKind::FileSystemError,
            GitvanError::JobTimeout { .. } => ErrorKind::JobTimeout,
            GitvanError::PoolClosed => ErrorKind::PoolClosed,
            GitvanError::AlreadyApplied { .. } => ErrorKind::AlreadyApplied,
            GitvanError::ReceiptWriteFailed { .. } => ErrorKind::ReceiptWriteFailed,
        }
    }
}

/// Error detail embedded in receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl ErrorDetail {
    /// Capture an `anyhow` chain for a receipt: the kind from the chain, the
    /// full context line as the message.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::classify(err),
            message: format!("{err:#}"),
            attempt: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}
