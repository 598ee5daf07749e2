//! Error taxonomy for sessions and remote calls.

use std::io;
use std::time::Duration;

use crate::fault::RemoteFault;
use crate::ident::ObjectId;

/// Error from making a remote call.
///
/// Every failure a caller can observe funnels into this type: transport
/// breakage, session shutdown, peer-side dispatch failures, and faults thrown
/// by the remote method itself.
#[derive(Debug, Clone)]
pub enum CallError {
    /// The session was shut down locally; the invocation was refused or
    /// interrupted.
    SessionClosed,
    /// The channel or transport failed mid-call.
    Transport(String),
    /// The peer cannot find a skeleton for the identifier.
    NoSuchObject(ObjectId),
    /// The peer cannot dispatch the selector, usually an interface version
    /// mismatch.
    NoSuchMethod(u32),
    /// A scheduled cancellation fired before the response arrived.
    Timeout(Duration),
    /// The worker pool was saturated at invocation or accept time.
    Rejected(Rejected),
    /// A value failed to encode or decode.
    Marshal(String),
    /// The remote method threw; transported with address stamping and a
    /// pruned trace.
    Remote(RemoteFault),
}

impl CallError {
    /// Classify an I/O failure observed on a channel. Decode problems are
    /// marshalling errors; everything else is transport breakage.
    pub(crate) fn from_io(e: &io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            CallError::Marshal(e.to_string())
        } else {
            CallError::Transport(e.to_string())
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::SessionClosed => write!(f, "session closed"),
            CallError::Transport(msg) => write!(f, "transport error: {msg}"),
            CallError::NoSuchObject(id) => write!(f, "no such object: {id}"),
            CallError::NoSuchMethod(selector) => write!(f, "no such method: selector {selector}"),
            CallError::Timeout(d) => write!(f, "call timed out after {d:?}"),
            CallError::Rejected(r) => write!(f, "{r}"),
            CallError::Marshal(msg) => write!(f, "marshal error: {msg}"),
            CallError::Remote(fault) => write!(f, "remote fault: {fault}"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<Rejected> for CallError {
    fn from(r: Rejected) -> Self {
        CallError::Rejected(r)
    }
}

impl From<RemoteFault> for CallError {
    fn from(fault: RemoteFault) -> Self {
        CallError::Remote(fault)
    }
}

/// The scheduler refused a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// True when refusal was caused by shutdown rather than saturation.
    pub shutdown: bool,
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.shutdown {
            write!(f, "rejected: scheduler is shut down")
        } else {
            write!(f, "rejected: too many active threads")
        }
    }
}

impl std::error::Error for Rejected {}
