#![deny(unsafe_code)]

//! Bidirectional remote-method-invocation runtime.
//!
//! Two peers connected by a duplex byte [`Transport`](transport::Transport)
//! each construct a [`Session`]. A session exposes local objects
//! (implementations of [`RemoteServer`]) to the peer and hands out
//! [`Stub`] proxies for the peer's objects; invocations travel over a pool
//! of recycled channels, and proxies that fall out of use are reclaimed on
//! the exporting side automatically.
//!
//! ```no_run
//! use tether::{mem, Session, SessionConfig, Value};
//!
//! let (near, far) = mem::pair();
//! let session = Session::connect(near, SessionConfig::default())?;
//! // On the other side: Session::connect(far, ...), export("greeter", ...).
//! # let _ = far;
//! let greeter = session.lookup("greeter")?;
//! let _reply = greeter.call(0, vec![Value::from("hello")])?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod mem;
pub mod scheduler;
pub mod tcp;
pub mod transport;

mod channel;
mod completion;
mod errors;
mod fault;
mod ident;
mod info;
mod pipe;
mod pool;
mod reclaim;
mod session;
mod skeleton;
mod stream;
mod stub;
mod value;
mod wire;

pub use completion::Completion;
pub use errors::{CallError, Rejected};
pub use fault::{FaultEntry, FaultFrame, RemoteFault};
pub use ident::ObjectId;
pub use info::{MethodFlags, MethodInfo, RemoteInfo, TypeDesc};
pub use pipe::Pipe;
pub use session::{Session, SessionConfig};
pub use skeleton::RemoteServer;
pub use stub::Stub;
pub use value::{Remote, Value};
