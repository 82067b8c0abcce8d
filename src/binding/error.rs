use thiserror::Error;

use super::request::Header;

/// Errors carried in response streams.
///
/// Values are `Clone` so a cached construction failure can be replayed to
/// every later request for the same header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("duplicate target requested: {0}")]
    DuplicateTarget(String),

    #[error("target already bound: {0}")]
    AlreadyBound(String),

    #[error("target is not bound: {0}")]
    NotBound(String),

    #[error("invalid request {target}: {reason}")]
    InvalidRequest { target: String, reason: String },

    #[error("could not construct {header}: {reason}")]
    Construction { header: Header, reason: String },

    #[error("bind {target} failed: {reason}")]
    Host { target: String, reason: String },

    #[error("bind {target} was undone after a sibling failed{}", close_suffix(.close_error))]
    Unwound { target: String, close_error: Option<String> },

    #[error("bind {target} was skipped after a sibling failed")]
    Skipped { target: String },

    #[error("release {target} failed: {reason}")]
    Release { target: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

fn close_suffix(close_error: &Option<String>) -> String {
    match close_error {
        Some(err) => format!(" (close failed: {err})"),
        None => String::new(),
    }
}

impl BindError {
    /// Short label used for the `outcome` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            BindError::DuplicateTarget(_) => "duplicate",
            BindError::AlreadyBound(_) => "already_bound",
            BindError::NotBound(_) => "not_bound",
            BindError::InvalidRequest { .. } => "invalid",
            BindError::Construction { .. } => "construction",
            BindError::Host { .. } => "host",
            BindError::Unwound { .. } => "unwound",
            BindError::Skipped { .. } => "skipped",
            BindError::Release { .. } => "release",
            BindError::Cancelled => "cancelled",
        }
    }
}
