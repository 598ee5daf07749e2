//! Server-side dispatch: skeletons bind identifiers to local objects.
//!
//! A skeleton decodes a selector and arguments and routes through the
//! dispatch table implied by the interface description. Asynchronous
//! methods give the channel back to the request loop before the body runs;
//! batched methods queue on the channel until a non-batched call (or an
//! explicit flush) applies the whole sequence in order; a successful
//! disposer return unexports the skeleton; pipe methods hand the raw
//! channel to the target.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{InvocationChannel, STATUS_BATCH_ACK, STATUS_FAULT, STATUS_OK};
use crate::completion::{COMPLETION_COMPLETE, COMPLETION_FAIL};
use crate::fault::{write_fault, RemoteFault, DISPATCH_MARKER};
use crate::ident::ObjectId;
use crate::info::{MethodFlags, MethodInfo, RemoteInfo, TypeDesc};
use crate::pipe::Pipe;
use crate::session::SessionInner;
use crate::value::{Remote, Value};

/// A remotely invocable object. Implementations describe themselves with a
/// [`RemoteInfo`] and dispatch on the selector, the method's index in that
/// description.
pub trait RemoteServer: Send + Sync {
    /// The interface description. Must be deterministic: the description is
    /// hashed into the type identifier both peers derive independently.
    fn remote_info(&self) -> Arc<RemoteInfo>;

    /// Invoke a method. Application failures are returned as faults; they
    /// are transported to the caller with this side's addresses stamped on.
    fn invoke(&self, selector: u32, args: Vec<Value>) -> Result<Value, RemoteFault>;

    /// Invoke a pipe-flagged method. The default refuses, for interfaces
    /// without pipe methods.
    fn invoke_pipe(
        &self,
        selector: u32,
        args: Vec<Value>,
        pipe: &mut Pipe,
    ) -> Result<(), RemoteFault> {
        let _ = (args, pipe);
        Err(RemoteFault::new(
            "tether.NoSuchMethod",
            format!("unknown selector {selector}"),
        ))
    }
}

/// Server-side binding of an identifier to a local object.
pub(crate) struct Skeleton {
    pub id: ObjectId,
    pub type_id: ObjectId,
    /// Identity of the server object, for interning.
    pub identity: usize,
    pub info: Arc<RemoteInfo>,
    pub server: Arc<dyn RemoteServer>,
}

impl Skeleton {
    pub fn new(id: ObjectId, server: Arc<dyn RemoteServer>) -> Arc<Self> {
        let info = server.remote_info();
        Arc::new(Self {
            id,
            type_id: info.type_id(),
            identity: Arc::as_ptr(&server) as *const () as usize,
            info,
            server,
        })
    }
}

/// Builds skeletons for exported objects.
pub(crate) trait SkeletonFactory: Send + Sync {
    fn create_skeleton(&self, id: ObjectId, server: Arc<dyn RemoteServer>) -> Arc<Skeleton>;
}

/// The dispatch-table skeleton factory.
pub(crate) struct DispatchSkeletonFactory;

impl SkeletonFactory for DispatchSkeletonFactory {
    fn create_skeleton(&self, id: ObjectId, server: Arc<dyn RemoteServer>) -> Arc<Skeleton> {
        Skeleton::new(id, server)
    }
}

/// One queued batched invocation bound to a channel.
struct QueuedCall {
    skeleton: Arc<Skeleton>,
    selector: u32,
    args: Vec<Value>,
    /// Caller-assigned identifier the result must be bound to.
    tentative: Option<ObjectId>,
}

/// Batch sequence state bound to a serving channel.
pub(crate) struct BatchState {
    queued: Vec<QueuedCall>,
    failed: Option<RemoteFault>,
}

impl BatchState {
    pub fn new() -> Self {
        Self {
            queued: Vec::new(),
            failed: None,
        }
    }
}

/// What the request loop should do with the channel next.
pub(crate) enum ServeFlow {
    Continue(InvocationChannel),
    Stop,
}

pub(crate) fn no_such_object_fault(id: ObjectId) -> RemoteFault {
    RemoteFault::new("tether.NoSuchObject", format!("no skeleton bound for {id}"))
}

fn no_such_method_fault(selector: u32) -> RemoteFault {
    RemoteFault::new("tether.NoSuchMethod", format!("unknown selector {selector}"))
}

/// Write a fault response and flush.
pub(crate) fn write_fault_response(
    chan: &mut InvocationChannel,
    fault: &RemoteFault,
) -> io::Result<()> {
    chan.out.write_u8(STATUS_FAULT)?;
    let local = chan.local_address.clone();
    let remote = chan.remote_address.clone();
    write_fault(&mut chan.out, Some(fault), &local, &remote)?;
    chan.flush()
}

/// Dispatch one request that the serving loop has already read the header
/// of. Owns the channel and hands it back unless the call consumed it.
pub(crate) fn dispatch(
    session: &Arc<SessionInner>,
    mut chan: InvocationChannel,
    batch: &mut BatchState,
    skeleton: Arc<Skeleton>,
    selector: u32,
    batched: bool,
) -> ServeFlow {
    let Some(method) = skeleton.info.get(selector).cloned() else {
        // Unknown selector: the argument encoding is unknowable, so the
        // stream cannot be re-synchronized. Report and drop the channel.
        let _ = write_fault_response(&mut chan, &no_such_method_fault(selector));
        chan.disconnect();
        return ServeFlow::Stop;
    };

    // Arguments are decoded even when a batch failure is pending, to keep
    // the stream position consistent.
    let argc = method.params.len() + usize::from(method.flags.contains(MethodFlags::COMPLETION));
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        match chan.read_value(&**session) {
            Ok(value) => args.push(value),
            Err(e) => {
                debug!(error = %e, selector, "failed to decode arguments");
                chan.disconnect();
                return ServeFlow::Stop;
            }
        }
    }

    let tentative = if batched && method.returns == TypeDesc::Remote {
        match ObjectId::read_from(&mut chan.inp) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(error = %e, "failed to read tentative identifier");
                chan.disconnect();
                return ServeFlow::Stop;
            }
        }
    } else {
        None
    };

    if batched {
        batch.queued.push(QueuedCall {
            skeleton,
            selector,
            args,
            tentative,
        });
        return ServeFlow::Continue(chan);
    }

    // A non-batched call closes any pending batch on this channel first.
    apply_batch(session, batch);
    if let Some(fault) = batch.failed.take() {
        // The closing call is skipped; the batch failure is its outcome.
        return respond(session, chan, Err(fault));
    }

    if method.flags.contains(MethodFlags::PIPE) {
        let mut pipe = Pipe::for_server(chan);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            skeleton.server.invoke_pipe(selector, args, &mut pipe)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(fault)) => debug!(%fault, "pipe method reported a fault"),
            Err(_) => warn!(selector, "pipe method panicked"),
        }
        return match pipe.finish_server() {
            Some(chan) => ServeFlow::Continue(chan),
            None => ServeFlow::Stop,
        };
    }

    if method.flags.intersects(MethodFlags::ASYNCHRONOUS | MethodFlags::COMPLETION) {
        // One-way on the wire: completion methods report through their
        // callback argument, plain asynchronous methods not at all. The
        // channel goes back to the request loop before the body runs, so
        // the caller is never gated on local work.
        let session2 = session.clone();
        let skeleton2 = skeleton.clone();
        let flags = method.flags;
        session.scheduler().execute_or_run(Box::new(move || {
            run_async(&session2, &skeleton2, selector, args, flags);
        }));
        return ServeFlow::Continue(chan);
    }

    let result = run_invoke(&skeleton, &method, selector, args);
    if result.is_ok() && method.flags.contains(MethodFlags::DISPOSER) {
        session.unexport_skeleton(skeleton.id);
    }
    respond(session, chan, result)
}

/// Resolve a pending batch without a closing call.
pub(crate) fn handle_flush(
    session: &Arc<SessionInner>,
    mut chan: InvocationChannel,
    batch: &mut BatchState,
) -> ServeFlow {
    apply_batch(session, batch);
    let io_result = match batch.failed.take() {
        Some(fault) => write_fault_response(&mut chan, &fault),
        None => chan.out.write_u8(STATUS_BATCH_ACK).and_then(|()| chan.flush()),
    };
    match io_result {
        Ok(()) => ServeFlow::Continue(chan),
        Err(e) => {
            debug!(error = %e, "failed to respond to batch flush");
            chan.disconnect();
            ServeFlow::Stop
        }
    }
}

/// Apply queued batched calls in program order. The first failure skips the
/// remainder of the sequence and is surfaced by the caller-side closing
/// call.
fn apply_batch(session: &Arc<SessionInner>, batch: &mut BatchState) {
    for call in batch.queued.drain(..) {
        if batch.failed.is_some() {
            continue;
        }
        let method = call
            .skeleton
            .info
            .get(call.selector)
            .cloned()
            .unwrap_or_else(|| MethodInfo::new("?", Vec::new(), TypeDesc::Any));

        match run_invoke(&call.skeleton, &method, call.selector, call.args) {
            Ok(value) => {
                if method.flags.contains(MethodFlags::DISPOSER) {
                    session.unexport_skeleton(call.skeleton.id);
                }
                if let Some(tentative) = call.tentative {
                    if let Err(fault) = bind_tentative(session, tentative, value) {
                        batch.failed = Some(fault);
                    }
                }
            }
            Err(fault) => batch.failed = Some(fault),
        }
    }
}

/// Bind a batched call's result to the identifier the caller assigned
/// optimistically.
fn bind_tentative(
    session: &Arc<SessionInner>,
    tentative: ObjectId,
    value: Value,
) -> Result<(), RemoteFault> {
    match value {
        Value::Remote(Remote::Server(server)) => {
            let skeleton = session.skeleton_factory().create_skeleton(tentative, server);
            session.bind_skeleton(tentative, skeleton);
            Ok(())
        }
        other => Err(RemoteFault::new(
            "tether.BadBatchedRemote",
            format!("batched method returned a non-exportable value: {other:?}"),
        )),
    }
}

fn run_async(
    session: &Arc<SessionInner>,
    skeleton: &Arc<Skeleton>,
    selector: u32,
    mut args: Vec<Value>,
    flags: MethodFlags,
) {
    let callback = if flags.contains(MethodFlags::COMPLETION) {
        args.pop()
    } else {
        None
    };

    let method = skeleton
        .info
        .get(selector)
        .cloned()
        .unwrap_or_else(|| MethodInfo::new("?", Vec::new(), TypeDesc::Any));
    let result = run_invoke(skeleton, &method, selector, args);
    if result.is_ok() && flags.contains(MethodFlags::DISPOSER) {
        session.unexport_skeleton(skeleton.id);
    }

    match callback {
        Some(Value::Remote(Remote::Stub(stub))) => {
            let callback_result = match result {
                Ok(value) => stub.call(COMPLETION_COMPLETE, vec![value]),
                Err(fault) => stub.call(COMPLETION_FAIL, vec![fault.into()]),
            };
            if let Err(e) = callback_result {
                debug!(error = %e, "failed to deliver completion callback");
            }
        }
        Some(other) => warn!(?other, "completion argument was not a remote stub"),
        None => {
            if let Err(fault) = result {
                // No response channel exists for a one-way method; the
                // fault can only be recorded locally.
                warn!(%fault, method = %method.name, "unhandled fault in asynchronous method");
            }
        }
    }
}

/// Run the target method, containing panics and anchoring the dispatch
/// frame that transported traces are pruned at.
fn run_invoke(
    skeleton: &Arc<Skeleton>,
    method: &MethodInfo,
    selector: u32,
    args: Vec<Value>,
) -> Result<Value, RemoteFault> {
    let server = skeleton.server.clone();
    let outcome = catch_unwind(AssertUnwindSafe(move || server.invoke(selector, args)));
    let dispatch_frame = |fault: RemoteFault| {
        fault.with_frame(
            format!("{}::{}", skeleton.info.name, method.name),
            DISPATCH_MARKER,
            0,
        )
    };
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(dispatch_frame(fault)),
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            };
            Err(dispatch_frame(RemoteFault::new("tether.Panic", msg)))
        }
    }
}

/// Write the call's outcome and hand the channel back.
fn respond(
    session: &Arc<SessionInner>,
    mut chan: InvocationChannel,
    result: Result<Value, RemoteFault>,
) -> ServeFlow {
    let io_result = match &result {
        Ok(value) => chan
            .out
            .write_u8(STATUS_OK)
            .and_then(|()| crate::value::write_value(&mut chan.out, value, &**session))
            .and_then(|()| chan.flush()),
        Err(fault) => write_fault_response(&mut chan, fault),
    };
    match io_result {
        Ok(()) => ServeFlow::Continue(chan),
        Err(e) => {
            debug!(error = %e, "failed to write response");
            chan.disconnect();
            ServeFlow::Stop
        }
    }
}
