//! Error types shared across the vinitd crates.

use thiserror::Error;

pub type VinitdResult<T> = Result<T, VinitdError>;

/// Errors surfaced by the init subsystems.
///
/// A `VinitdError` reaching the boot pipeline is fatal: the orchestrator
/// logs it and powers the machine off. Recoverable conditions are logged
/// at the call site and never become a `VinitdError`.
#[derive(Error, Debug)]
pub enum VinitdError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("disk error: {0}")]
    Disk(String),

    #[error("mount {source_fs} on {dest} failed: {detail}")]
    Mount {
        source_fs: String,
        dest: String,
        detail: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("dhcp error: {0}")]
    Dhcp(String),

    #[error("launch error: {0}")]
    Launch(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VinitdError {
    /// Shorthand used by subsystems that map foreign errors by hand.
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        VinitdError::Internal(err.to_string())
    }
}
