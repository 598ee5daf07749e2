//! Client-side proxy runtime.
//!
//! A [`Stub`] forwards calls over a pooled channel to the skeleton named by
//! its identifier. There is no generated code: a call is a selector plus a
//! vector of values, routed by the method's flags from the interface
//! description. The support layer underneath implements the channel
//! acquire/finish/fail protocol, timeout scheduling, and the thread-pinned
//! batch channel; disposing a stub atomically swaps the support for a
//! tombstone that fails every operation.

use std::cell::RefCell;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::channel::{
    InvocationChannel, MODE_BATCHED, MODE_CALL, STATUS_BATCH_ACK, STATUS_FAULT, STATUS_OK,
};
use crate::completion::Completion;
use crate::errors::CallError;
use crate::fault::{read_fault, RemoteFault};
use crate::ident::{ObjectId, VersionedId};
use crate::info::{MethodFlags, MethodInfo, RemoteInfo, TypeDesc};
use crate::pipe::Pipe;
use crate::scheduler::ScheduledHandle;
use crate::session::SessionInner;
use crate::value::Value;

enum Support {
    Active(Weak<SessionInner>),
    /// Proactively disposed; every operation reports no-such-object.
    Disposed,
    /// Session shut down; every operation reports session-closed.
    Closed,
}

/// Shared state behind a stub. The registry holds this weakly; dropping the
/// last user reference enqueues the identifier for distributed reclamation.
pub(crate) struct StubState {
    pub id: ObjectId,
    pub type_id: ObjectId,
    pub info: Arc<RemoteInfo>,
    support: RwLock<Support>,
}

impl StubState {
    pub fn new(
        id: ObjectId,
        type_id: ObjectId,
        info: Arc<RemoteInfo>,
        session: Weak<SessionInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            type_id,
            info,
            support: RwLock::new(Support::Active(session)),
        })
    }

    fn session(&self) -> Result<Arc<SessionInner>, CallError> {
        match &*self.support.read() {
            Support::Active(weak) => weak.upgrade().ok_or(CallError::SessionClosed),
            Support::Disposed => Err(CallError::NoSuchObject(self.id)),
            Support::Closed => Err(CallError::SessionClosed),
        }
    }

    /// Swap in the no-such-object tombstone.
    pub fn dispose_tombstone(&self) {
        *self.support.write() = Support::Disposed;
    }

    /// Swap in the session-closed tombstone.
    pub fn mark_session_closed(&self) {
        *self.support.write() = Support::Closed;
    }

    fn versioned_id(&self, session: &SessionInner) -> VersionedId {
        let (local_version, remote_version) = session.stub_versions(self.id);
        VersionedId {
            id: self.id,
            local_version,
            remote_version,
        }
    }

    /// Acquire a channel and write the request header on it.
    fn invoke(
        &self,
        session: &Arc<SessionInner>,
        mode: u8,
        selector: u32,
    ) -> Result<InvocationChannel, CallError> {
        let mut chan = session.acquire_channel()?;
        let vid = self.versioned_id(session);
        if let Err(e) = chan.write_request(mode, vid, selector) {
            return Err(self.failed(session, chan, e));
        }
        Ok(chan)
    }

    /// As [`Self::invoke`], also scheduling a task that severs the channel
    /// when the timeout expires.
    fn invoke_timed(
        &self,
        session: &Arc<SessionInner>,
        mode: u8,
        selector: u32,
        timeout: Duration,
    ) -> Result<(InvocationChannel, ScheduledHandle), CallError> {
        let mut chan = session.acquire_channel()?;
        let timer = session.schedule_disconnect(chan.closer.clone(), timeout)?;
        let vid = self.versioned_id(session);
        if let Err(e) = chan.write_request(mode, vid, selector) {
            return Err(self.failed_and_cancel_timeout(session, chan, e, timer, timeout));
        }
        Ok((chan, timer))
    }

    /// Return the channel to the pool after a normal completion.
    fn finished(&self, session: &SessionInner, chan: InvocationChannel, reset: bool) {
        session.release_channel(chan, reset);
    }

    fn finished_and_cancel_timeout(
        &self,
        session: &SessionInner,
        chan: InvocationChannel,
        reset: bool,
        timer: ScheduledHandle,
    ) {
        timer.cancel();
        session.release_channel(chan, reset);
    }

    /// Close a broken channel and map the failure for the caller.
    fn failed(&self, session: &SessionInner, chan: InvocationChannel, cause: io::Error) -> CallError {
        session.discard_channel(chan);
        if session.is_closing() {
            CallError::SessionClosed
        } else {
            CallError::from_io(&cause)
        }
    }

    /// As [`Self::failed`]; when the cancellation token says the timer
    /// fired, the breakage is reported as a timeout instead.
    fn failed_and_cancel_timeout(
        &self,
        session: &SessionInner,
        chan: InvocationChannel,
        cause: io::Error,
        timer: ScheduledHandle,
        timeout: Duration,
    ) -> CallError {
        let cancelled_in_time = timer.cancel();
        if !cancelled_in_time && timer.has_fired() {
            session.discard_channel(chan);
            return CallError::Timeout(timeout);
        }
        self.failed(session, chan, cause)
    }
}

impl Drop for StubState {
    fn drop(&mut self) {
        if let Support::Active(weak) = &*self.support.read() {
            if let Some(session) = weak.upgrade() {
                session.stub_dropped(self.id);
            }
        }
    }
}

/// Builds stubs for resolved remote references.
pub(crate) trait StubFactory: Send + Sync {
    fn create_stub(
        &self,
        id: ObjectId,
        type_id: ObjectId,
        info: Arc<RemoteInfo>,
        session: Weak<SessionInner>,
    ) -> Arc<StubState>;
}

/// The dispatch-table stub factory: every interface shares one stub shape.
pub(crate) struct DispatchStubFactory;

impl StubFactory for DispatchStubFactory {
    fn create_stub(
        &self,
        id: ObjectId,
        type_id: ObjectId,
        info: Arc<RemoteInfo>,
        session: Weak<SessionInner>,
    ) -> Arc<StubState> {
        StubState::new(id, type_id, info, session)
    }
}

// ---------------------------------------------------------------------------
// Thread-pinned batch channel
// ---------------------------------------------------------------------------

pub(crate) struct ThreadBatch {
    pub chan: InvocationChannel,
    pub session_key: usize,
}

thread_local! {
    static BATCH: RefCell<Option<ThreadBatch>> = const { RefCell::new(None) };
}

/// Take the thread's pinned batch channel when it belongs to `session_key`.
pub(crate) fn take_thread_batch(session_key: usize) -> Option<ThreadBatch> {
    BATCH.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.as_ref().is_some_and(|b| b.session_key == session_key) {
            slot.take()
        } else {
            None
        }
    })
}

/// Pin a batch channel to the current thread.
///
/// # Panics
///
/// Panics if a batch channel is already pinned, which indicates a missing
/// `rebatch` pairing.
pub(crate) fn pin_thread_batch(batch: ThreadBatch) {
    BATCH.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(
            slot.is_none(),
            "a batch channel is already pinned to this thread"
        );
        *slot = Some(batch);
    });
}

/// Detach the thread's batch channel across an unbatched call, whatever
/// session it belongs to.
pub(crate) fn unbatch() -> Option<ThreadBatch> {
    BATCH.with(|slot| slot.borrow_mut().take())
}

/// Restore a batch channel saved by [`unbatch`].
///
/// # Panics
///
/// Panics if another batch channel was pinned in between.
pub(crate) fn rebatch(saved: Option<ThreadBatch>) {
    if let Some(batch) = saved {
        pin_thread_batch(batch);
    }
}

/// Transmit a pending batch and wait for its resolution.
pub(crate) fn flush_batch(
    session: &Arc<SessionInner>,
    batch: ThreadBatch,
) -> Result<(), CallError> {
    let mut chan = batch.chan;
    let outcome = (|| -> io::Result<Result<(), CallError>> {
        chan.write_flush_request()?;
        chan.flush()?;
        match chan.inp.read_u8()? {
            STATUS_BATCH_ACK => Ok(Ok(())),
            STATUS_FAULT => {
                let fault = read_fault(&mut chan.inp)?
                    .ok_or_else(|| crate::wire::invalid_data("missing fault payload"))?;
                Ok(Err(fault_to_error(fault)))
            }
            other => Err(crate::wire::invalid_data(format!(
                "invalid batch flush status {other}"
            ))),
        }
    })();

    match outcome {
        Ok(result) => {
            session.release_channel(chan, true);
            result
        }
        Err(e) => {
            session.discard_channel(chan);
            if session.is_closing() {
                Err(CallError::SessionClosed)
            } else {
                Err(CallError::from_io(&e))
            }
        }
    }
}

/// Map special fault types the serving side uses for dispatch failures back
/// to their structured errors.
pub(crate) fn fault_to_error(fault: RemoteFault) -> CallError {
    match fault.head().type_name.as_str() {
        "tether.NoSuchObject" => {
            let id = fault
                .head()
                .message
                .as_deref()
                .and_then(parse_id)
                .unwrap_or_else(|| ObjectId::from_bytes([0; 16]));
            CallError::NoSuchObject(id)
        }
        "tether.NoSuchMethod" => {
            let selector = fault
                .head()
                .message
                .as_deref()
                .and_then(|m| m.rsplit(' ').next())
                .and_then(|s| s.parse().ok())
                .unwrap_or(u32::MAX);
            CallError::NoSuchMethod(selector)
        }
        _ => CallError::Remote(fault),
    }
}

fn parse_id(message: &str) -> Option<ObjectId> {
    let hex = message.rsplit(' ').next()?;
    let uuid = hex.parse::<uuid::Uuid>().ok()?;
    Some(ObjectId::from_bytes(*uuid.as_bytes()))
}

// ---------------------------------------------------------------------------
// Stub
// ---------------------------------------------------------------------------

/// Client-side proxy for a remote object.
#[derive(Clone)]
pub struct Stub {
    pub(crate) state: Arc<StubState>,
}

impl Stub {
    pub fn object_id(&self) -> ObjectId {
        self.state.id
    }

    pub fn info(&self) -> &Arc<RemoteInfo> {
        &self.state.info
    }

    /// True when both handles share one underlying proxy instance, as
    /// concurrent deserializations of the same reference must.
    pub fn ptr_eq(&self, other: &Stub) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Invoke a method with the timeout defaults from the description.
    pub fn call(&self, selector: u32, args: Vec<Value>) -> Result<Value, CallError> {
        self.call_timed(selector, args, None)
    }

    /// Invoke a method with an explicit timeout, overriding any default.
    pub fn call_timed(
        &self,
        selector: u32,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let method = self
            .state
            .info
            .get(selector)
            .ok_or(CallError::NoSuchMethod(selector))?
            .clone();
        let flags = method.flags;

        assert!(
            !flags.contains(MethodFlags::PIPE),
            "pipe methods must be invoked through call_pipe"
        );

        if flags.contains(MethodFlags::COMPLETION) {
            return self.call_async(selector, args)?.wait();
        }

        if flags.contains(MethodFlags::BATCHED) {
            assert!(
                method.returns != TypeDesc::Remote,
                "batched methods returning a remote must go through call_batched_remote"
            );
            return self.call_batched(selector, args, None);
        }

        if flags.contains(MethodFlags::UNBATCHED) {
            let saved = unbatch();
            let result = self.call_plain(selector, args, timeout, &method, false);
            rebatch(saved);
            return result;
        }

        self.call_plain(selector, args, timeout, &method, true)
    }

    /// Invoke an asynchronous method that reports through a completion.
    pub fn call_async(
        &self,
        selector: u32,
        mut args: Vec<Value>,
    ) -> Result<Completion, CallError> {
        let method = self
            .state
            .info
            .get(selector)
            .ok_or(CallError::NoSuchMethod(selector))?;
        assert!(
            method.flags.contains(MethodFlags::COMPLETION),
            "call_async requires a completion-flagged method"
        );

        let session = self.state.session()?;
        let (completion, callback) = session.create_completion();
        args.push(Value::Remote(callback));

        self.send_one_way(&session, selector, args)?;
        Ok(completion)
    }

    /// Invoke a batched method that returns a remote object. The identifier
    /// is assigned optimistically now; the peer binds its result to it when
    /// the batch executes.
    pub fn call_batched_remote(
        &self,
        selector: u32,
        args: Vec<Value>,
        returns: Arc<RemoteInfo>,
    ) -> Result<Stub, CallError> {
        let method = self
            .state
            .info
            .get(selector)
            .ok_or(CallError::NoSuchMethod(selector))?;
        assert!(
            method.flags.contains(MethodFlags::BATCHED) && method.returns == TypeDesc::Remote,
            "call_batched_remote requires a batched method returning a remote"
        );

        let tentative = ObjectId::random();
        self.call_batched(selector, args, Some(tentative))?;

        let session = self.state.session()?;
        let stub = session.register_tentative_stub(tentative, returns);
        Ok(stub)
    }

    /// Invoke a pipe method: after the request is flushed, the raw channel
    /// is handed over as a user-level byte pipe.
    pub fn call_pipe(&self, selector: u32, args: Vec<Value>) -> Result<Pipe, CallError> {
        let method = self
            .state
            .info
            .get(selector)
            .ok_or(CallError::NoSuchMethod(selector))?;
        assert!(
            method.flags.contains(MethodFlags::PIPE),
            "call_pipe requires a pipe-flagged method"
        );

        let session = self.state.session()?;
        if let Some(batch) = take_thread_batch(session.session_key()) {
            flush_batch(&session, batch)?;
        }

        let mut chan = self.state.invoke(&session, MODE_CALL, selector)?;
        for arg in &args {
            if let Err(e) = chan.write_value(arg, &*session) {
                return Err(self.state.failed(&session, chan, e));
            }
        }
        if let Err(e) = chan.flush() {
            return Err(self.state.failed(&session, chan, e));
        }
        Ok(Pipe::for_client(chan, Arc::downgrade(&session)))
    }

    fn call_plain(
        &self,
        selector: u32,
        args: Vec<Value>,
        timeout: Option<Duration>,
        method: &MethodInfo,
        close_batch: bool,
    ) -> Result<Value, CallError> {
        let session = self.state.session()?;
        let effective = effective_timeout(&self.state.info, selector, timeout);

        if method.flags.contains(MethodFlags::ASYNCHRONOUS) {
            // A one-way call cannot carry a pending batch's resolution, so
            // resolve the batch separately first.
            if close_batch {
                if let Some(batch) = take_thread_batch(session.session_key()) {
                    flush_batch(&session, batch)?;
                }
            }
            self.send_one_way(&session, selector, args)?;
            return Ok(Value::Null);
        }

        let pending = if close_batch {
            take_thread_batch(session.session_key())
        } else {
            None
        };

        let result = match (pending, effective) {
            (Some(batch), timeout) => {
                // Closing call rides the pinned channel so the queued
                // batched requests resolve in program order ahead of it.
                let mut chan = batch.chan;
                let timer = match timeout {
                    Some(t) => Some(session.schedule_disconnect(chan.closer.clone(), t)?),
                    None => None,
                };
                let vid = self.state.versioned_id(&session);
                match chan.write_request(MODE_CALL, vid, selector) {
                    Ok(()) => self.exchange(&session, chan, args, timer, timeout),
                    Err(e) => Err(match timer {
                        Some(timer) => self.state.failed_and_cancel_timeout(
                            &session,
                            chan,
                            e,
                            timer,
                            timeout.unwrap_or_default(),
                        ),
                        None => self.state.failed(&session, chan, e),
                    }),
                }
            }
            (None, Some(t)) => {
                let (chan, timer) = self.state.invoke_timed(&session, MODE_CALL, selector, t)?;
                self.exchange(&session, chan, args, Some(timer), Some(t))
            }
            (None, None) => {
                let chan = self.state.invoke(&session, MODE_CALL, selector)?;
                self.exchange(&session, chan, args, None, None)
            }
        };

        if result.is_ok() && method.flags.contains(MethodFlags::DISPOSER) {
            // A successful disposer return retires the proxy; the peer has
            // already unexported the skeleton.
            session.retire_stub(self);
        }
        result
    }

    /// Write arguments, flush, read the status and payload.
    fn exchange(
        &self,
        session: &Arc<SessionInner>,
        mut chan: InvocationChannel,
        args: Vec<Value>,
        timer: Option<ScheduledHandle>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let io_result = (|| -> io::Result<Result<Value, CallError>> {
            for arg in &args {
                chan.write_value(arg, &**session)?;
            }
            chan.flush()?;
            match chan.inp.read_u8()? {
                STATUS_OK => Ok(Ok(chan.read_value(&**session)?)),
                STATUS_FAULT => {
                    let fault = read_fault(&mut chan.inp)?
                        .ok_or_else(|| crate::wire::invalid_data("missing fault payload"))?;
                    Ok(Err(fault_to_error(fault)))
                }
                other => Err(crate::wire::invalid_data(format!(
                    "invalid response status {other}"
                ))),
            }
        })();

        match io_result {
            Ok(result) => {
                match timer {
                    Some(timer) => self.state.finished_and_cancel_timeout(session, chan, true, timer),
                    None => self.state.finished(session, chan, true),
                }
                result
            }
            Err(e) => Err(match timer {
                Some(timer) => self.state.failed_and_cancel_timeout(
                    session,
                    chan,
                    e,
                    timer,
                    timeout.unwrap_or_default(),
                ),
                None => self.state.failed(session, chan, e),
            }),
        }
    }

    /// Write a request that expects no response, then return the channel.
    fn send_one_way(
        &self,
        session: &Arc<SessionInner>,
        selector: u32,
        args: Vec<Value>,
    ) -> Result<(), CallError> {
        let mut chan = self.state.invoke(session, MODE_CALL, selector)?;
        let io_result = (|| -> io::Result<()> {
            for arg in &args {
                chan.write_value(arg, &**session)?;
            }
            chan.flush()
        })();

        match io_result {
            Ok(()) => {
                self.state.finished(session, chan, true);
                Ok(())
            }
            Err(e) => Err(self.state.failed(session, chan, e)),
        }
    }

    /// Buffer a batched request on the thread's pinned channel.
    fn call_batched(
        &self,
        selector: u32,
        args: Vec<Value>,
        tentative: Option<ObjectId>,
    ) -> Result<Value, CallError> {
        let session = self.state.session()?;
        let key = session.session_key();

        let mut chan = match take_thread_batch(key) {
            Some(batch) => batch.chan,
            None => session.acquire_channel()?,
        };

        let vid = self.state.versioned_id(&session);
        let io_result = (|| -> io::Result<()> {
            chan.write_request(MODE_BATCHED, vid, selector)?;
            for arg in &args {
                chan.write_value(arg, &*session)?;
            }
            if let Some(tentative) = tentative {
                tentative.write_to(&mut chan.out)?;
            }
            Ok(())
        })();

        match io_result {
            Ok(()) => {
                debug!(selector, "batched request buffered");
                pin_thread_batch(ThreadBatch {
                    chan,
                    session_key: key,
                });
                Ok(Value::Null)
            }
            Err(e) => Err(self.state.failed(&session, chan, e)),
        }
    }
}

fn effective_timeout(
    info: &RemoteInfo,
    selector: u32,
    explicit: Option<Duration>,
) -> Option<Duration> {
    if let Some(d) = explicit {
        return Some(d);
    }
    match info.timeout_for(selector) {
        Some(ms) if ms >= 0 => Some(Duration::from_millis(ms as u64)),
        _ => None,
    }
}

impl PartialEq for Stub {
    fn eq(&self, other: &Self) -> bool {
        self.state.id == other.state.id
    }
}

impl Eq for Stub {}

impl std::hash::Hash for Stub {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.state.id.hash(state);
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stub({} @ {})", self.state.info.name, self.state.id)
    }
}

impl std::fmt::Display for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state.id)
    }
}
