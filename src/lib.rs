pub mod checkpoint;
pub mod daemon;
pub mod gpu;
pub mod protocol;
pub mod util;

use thiserror::Error;

use crate::protocol::ProcessState;

/// Errors surfaced to clients over the control socket.
///
/// The display strings are the wire format: `Response::err` carries
/// `error.to_string()` verbatim, so messages here are stable protocol.
#[derive(Error, Debug)]
pub enum Error {
    #[error("process {0:?} not found")]
    NotFound(String),

    #[error("process {0:?} already exists")]
    AlreadyExists(String),

    #[error("process {name:?} is {actual}, not {expected}")]
    WrongState {
        name: String,
        actual: ProcessState,
        expected: &'static str,
    },

    #[error("{0} not available")]
    CapabilityMissing(&'static str),

    #[error("{tool} {action}: {detail}")]
    Tool {
        tool: &'static str,
        action: String,
        detail: String,
    },

    #[error("bad params: {0}")]
    BadParams(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
