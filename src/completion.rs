//! One-shot future used as the result carrier of asynchronous calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::CallError;
use crate::fault::RemoteFault;
use crate::info::{MethodFlags, MethodInfo, RemoteInfo, TypeDesc};
use crate::skeleton::RemoteServer;
use crate::value::Value;

enum Slot {
    Empty,
    Ready(Result<Value, CallError>),
}

struct State {
    slot: Mutex<Slot>,
    cv: Condvar,
}

/// Holds either a value, an error, or neither yet. Transitions once and
/// signals every waiter; completing an already-completed instance is a
/// no-op.
#[derive(Clone)]
pub struct Completion {
    state: Arc<State>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                slot: Mutex::new(Slot::Empty),
                cv: Condvar::new(),
            }),
        }
    }

    /// Deliver the outcome. Returns false when the completion was already
    /// settled.
    pub(crate) fn complete(&self, outcome: Result<Value, CallError>) -> bool {
        let mut slot = self.state.slot.lock();
        if matches!(&*slot, Slot::Ready(_)) {
            return false;
        }
        *slot = Slot::Ready(outcome);
        self.state.cv.notify_all();
        true
    }

    /// Cancel: waiters observe the session-closed error.
    pub(crate) fn cancel(&self) -> bool {
        self.complete(Err(CallError::SessionClosed))
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.state.slot.lock(), Slot::Ready(_))
    }

    pub fn try_get(&self) -> Option<Result<Value, CallError>> {
        match &*self.state.slot.lock() {
            Slot::Ready(outcome) => Some(outcome.clone()),
            Slot::Empty => None,
        }
    }

    /// Block until the outcome arrives.
    pub fn wait(&self) -> Result<Value, CallError> {
        let mut slot = self.state.slot.lock();
        loop {
            if let Slot::Ready(outcome) = &*slot {
                return outcome.clone();
            }
            self.state.cv.wait(&mut slot);
        }
    }

    /// Block up to `timeout`; `None` when it elapses first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value, CallError>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.state.slot.lock();
        loop {
            if let Slot::Ready(outcome) = &*slot {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.state.cv.wait_for(&mut slot, deadline - now);
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCompletion {
        WeakCompletion {
            state: Arc::downgrade(&self.state),
        }
    }
}

/// Weak handle the session keeps so close can cancel outstanding futures
/// without pinning them alive.
pub(crate) struct WeakCompletion {
    state: std::sync::Weak<State>,
}

impl WeakCompletion {
    pub fn upgrade(&self) -> Option<Completion> {
        self.state.upgrade().map(|state| Completion { state })
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Selector of the value callback on the completion interface.
pub(crate) const COMPLETION_COMPLETE: u32 = 0;
/// Selector of the error callback.
pub(crate) const COMPLETION_FAIL: u32 = 1;

/// Description of the hidden callback interface behind every asynchronous
/// call that returns a future. Both callbacks are asynchronous disposers:
/// the single invocation releases the callback skeleton.
pub(crate) fn completion_remote_info() -> Arc<RemoteInfo> {
    Arc::new(
        RemoteInfo::new("tether.Completion")
            .method(
                MethodInfo::new("complete", vec![TypeDesc::Any], TypeDesc::Void)
                    .flags(MethodFlags::ASYNCHRONOUS | MethodFlags::DISPOSER),
            )
            .method(
                MethodInfo::new("fail", vec![TypeDesc::Fault], TypeDesc::Void)
                    .flags(MethodFlags::ASYNCHRONOUS | MethodFlags::DISPOSER),
            ),
    )
}

/// Skeleton-side half of a completion pair: invoked once by the peer to
/// settle the stub-side future.
pub(crate) struct CompletionServer {
    completion: Completion,
}

impl CompletionServer {
    pub fn new(completion: Completion) -> Self {
        Self { completion }
    }
}

impl RemoteServer for CompletionServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        completion_remote_info()
    }

    fn invoke(&self, selector: u32, mut args: Vec<Value>) -> Result<Value, RemoteFault> {
        let arg = if args.is_empty() {
            Value::Null
        } else {
            args.swap_remove(0)
        };
        match selector {
            COMPLETION_COMPLETE => {
                self.completion.complete(Ok(arg));
                Ok(Value::Null)
            }
            COMPLETION_FAIL => {
                let fault = match arg {
                    Value::Fault(fault) => *fault,
                    other => RemoteFault::new(
                        "tether.BadCompletion",
                        format!("non-fault failure payload: {other:?}"),
                    ),
                };
                self.completion.complete(Err(CallError::Remote(fault)));
                Ok(Value::Null)
            }
            other => Err(RemoteFault::new(
                "tether.NoSuchMethod",
                format!("completion selector {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_and_signals_waiters() {
        let completion = Completion::new();
        let waiter = completion.clone();
        let handle = std::thread::spawn(move || waiter.wait());

        std::thread::sleep(Duration::from_millis(20));
        assert!(completion.complete(Ok(Value::Int(9))));
        assert!(!completion.complete(Ok(Value::Int(10))));

        assert_eq!(handle.join().unwrap().unwrap(), Value::Int(9));
        assert_eq!(completion.try_get().unwrap().unwrap(), Value::Int(9));
    }

    #[test]
    fn wait_timeout_expires_when_empty() {
        let completion = Completion::new();
        let start = Instant::now();
        assert!(completion.wait_timeout(Duration::from_millis(40)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn cancel_is_observed_as_session_closed() {
        let completion = Completion::new();
        assert!(completion.cancel());
        match completion.wait() {
            Err(CallError::SessionClosed) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn completion_server_settles_the_future() {
        let completion = Completion::new();
        let server = CompletionServer::new(completion.clone());

        server.invoke(COMPLETION_COMPLETE, vec![Value::Str("done".into())]).unwrap();
        assert_eq!(completion.wait().unwrap(), Value::Str("done".into()));

        let failed = Completion::new();
        let server = CompletionServer::new(failed.clone());
        server
            .invoke(COMPLETION_FAIL, vec![RemoteFault::new("x.Err", "bad").into()])
            .unwrap();
        match failed.wait() {
            Err(CallError::Remote(fault)) => assert_eq!(fault.head().type_name, "x.Err"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
