//! # ERROR
//!
//! Error kinds surfaced by the [Transport] and [Protocol] layers.
//!
//! [Transport]: crate::transport::Transport
//! [Protocol]:  crate::protocol::Protocol

use thiserror::Error;

/// ## STOMP ERROR
///
/// Every error kind the core transport and protocol engine can surface.
///
/// `ConnectFailed` and `NotConnected` are raised synchronously to the
/// caller. `MalformedFrame`, `FrameTooLarge`, and `SocketFailure` are
/// raised on the receiver thread and are instead reported as a synthetic
/// `ERROR` frame dispatch (see [`Transport`]) rather than propagated,
/// except where noted.
///
/// [`Transport`]: crate::transport::Transport
#[derive(Debug, Error)]
pub enum StompError {
    /// [`attemptConnection`] exhausted its attempt budget, or
    /// `connect(wait=true)` observed `connectionError`.
    ///
    /// [`attemptConnection`]: crate::transport::Transport::attempt_connection
    #[error("failed to connect after exhausting reconnect attempts")]
    ConnectFailed,

    /// `transmit` was called while no socket is bound.
    #[error("transmit called while not connected")]
    NotConnected,

    /// The framer or frame parser rejected malformed input.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame (before its terminating NUL) would overflow the carryover
    /// buffer's fixed capacity.
    #[error("frame of {size} bytes exceeds the {limit}-byte carryover buffer")]
    FrameTooLarge { size: usize, limit: usize },

    /// An unrecoverable socket error outside of `attemptConnection`.
    #[error("socket failure: {0}")]
    SocketFailure(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type StompResult<T> = Result<T, StompError>;
