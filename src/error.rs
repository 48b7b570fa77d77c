//! Error kinds recognised by the core (spec §7).

use thiserror::Error;

/// Errors surfaced by individual components. Protocol/state errors are
/// recovered at the session boundary, transport errors at the adapter
/// boundary, configuration errors at the supervisor boundary — nothing
/// below the supervisor calls a global-exit mechanism.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("state error: {0}")]
    State(String),

    #[error("slot error: {0}")]
    Slot(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
