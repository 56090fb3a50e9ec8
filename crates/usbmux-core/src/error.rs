//! Error types for the listener.

use usbmux_rpc::ResponseCode;

use crate::listener::ListenerState;

/// Errors surfaced by listener operations
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    Rpc(#[from] usbmux_rpc::Error),

    #[error("Daemon rejected Listen after {attempts} attempts (last: {})", describe(.last.as_ref()))]
    ListenRejected {
        attempts: u32,
        last: Option<ResponseCode>,
    },

    #[error("Daemon rejected request: {0}")]
    Rejected(ResponseCode),

    #[error("Listener is not connected")]
    NotConnected,

    #[error("Listener already started ({0:?})")]
    AlreadyStarted(ListenerState),

    #[error("Listener startup cancelled")]
    Cancelled,

    #[error("Listener closed")]
    Closed,

    #[error("Unexpected reply: missing {0}")]
    UnexpectedReply(&'static str),
}

fn describe(code: Option<&ResponseCode>) -> String {
    code.map_or_else(|| "no reply".to_string(), ToString::to_string)
}

pub type Result<T> = std::result::Result<T, ListenerError>;
