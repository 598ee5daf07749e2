//! End-to-end scenarios: two sessions over the in-memory transport.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether::{
    mem, CallError, MethodFlags, MethodInfo, Pipe, RemoteFault, RemoteInfo, RemoteServer, Remote,
    Session, SessionConfig, TypeDesc, Value,
};

fn test_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

fn session_pair(config_a: SessionConfig, config_b: SessionConfig) -> (Session, Session) {
    let (ta, tb) = mem::pair();
    let b = std::thread::spawn(move || Session::connect(tb, config_b).unwrap());
    let a = Session::connect(ta, config_a).unwrap();
    (a, b.join().unwrap())
}

/// Poll until `probe` returns true or the deadline passes.
fn eventually(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    probe()
}

// ---------------------------------------------------------------------------
// Servers used by the scenarios
// ---------------------------------------------------------------------------

struct EchoServer;

impl RemoteServer for EchoServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(
            RemoteInfo::new("test.Echo")
                .method(MethodInfo::new("echo", vec![TypeDesc::Str], TypeDesc::Str)),
        )
    }

    fn invoke(&self, selector: u32, mut args: Vec<Value>) -> Result<Value, RemoteFault> {
        match selector {
            0 => Ok(args.swap_remove(0)),
            other => Err(RemoteFault::new("test.Bad", format!("selector {other}"))),
        }
    }
}

struct SleepServer {
    millis: u64,
}

impl RemoteServer for SleepServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(
            RemoteInfo::new("test.Sleeper")
                .method(MethodInfo::new("nap", Vec::new(), TypeDesc::Void)),
        )
    }

    fn invoke(&self, _selector: u32, _args: Vec<Value>) -> Result<Value, RemoteFault> {
        std::thread::sleep(Duration::from_millis(self.millis));
        Ok(Value::Null)
    }
}

struct AdderServer;

impl RemoteServer for AdderServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(RemoteInfo::new("test.Adder").method(
            MethodInfo::new("add_slow", vec![TypeDesc::Int, TypeDesc::Int], TypeDesc::Int)
                .flags(MethodFlags::ASYNCHRONOUS | MethodFlags::COMPLETION),
        ))
    }

    fn invoke(&self, _selector: u32, args: Vec<Value>) -> Result<Value, RemoteFault> {
        std::thread::sleep(Duration::from_millis(30));
        let a = args[0].as_int().unwrap_or(0);
        let b = args[1].as_int().unwrap_or(0);
        Ok(Value::Int(a + b))
    }
}

struct Child {
    name: String,
}

impl RemoteServer for Child {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        child_info()
    }

    fn invoke(&self, _selector: u32, _args: Vec<Value>) -> Result<Value, RemoteFault> {
        Ok(Value::from(self.name.clone()))
    }
}

fn child_info() -> Arc<RemoteInfo> {
    Arc::new(
        RemoteInfo::new("test.Child")
            .method(MethodInfo::new("name", Vec::new(), TypeDesc::Str)),
    )
}

struct FactoryServer {
    minted: AtomicUsize,
}

impl RemoteServer for FactoryServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(
            RemoteInfo::new("test.Factory").method(
                MethodInfo::new("new_child", Vec::new(), TypeDesc::Remote)
                    .flags(MethodFlags::BATCHED),
            ),
        )
    }

    fn invoke(&self, _selector: u32, _args: Vec<Value>) -> Result<Value, RemoteFault> {
        let n = self.minted.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Remote(Remote::server(Child {
            name: format!("child-{n}"),
        })))
    }
}

struct RecorderServer {
    seen: Mutex<Vec<i64>>,
}

impl RemoteServer for RecorderServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(
            RemoteInfo::new("test.Recorder")
                .method(
                    MethodInfo::new("note", vec![TypeDesc::Int], TypeDesc::Void)
                        .flags(MethodFlags::BATCHED),
                )
                .method(MethodInfo::new("order", Vec::new(), TypeDesc::List)),
        )
    }

    fn invoke(&self, selector: u32, args: Vec<Value>) -> Result<Value, RemoteFault> {
        match selector {
            0 => {
                let n = args[0].as_int().unwrap_or(-1);
                self.seen.lock().unwrap().push(n);
                Ok(Value::Null)
            }
            1 => Ok(Value::List(
                self.seen
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|&n| Value::Int(n))
                    .collect(),
            )),
            other => Err(RemoteFault::new("test.Bad", format!("selector {other}"))),
        }
    }
}

struct ThrowServer;

impl RemoteServer for ThrowServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(
            RemoteInfo::new("test.Thrower")
                .method(MethodInfo::new("boom", Vec::new(), TypeDesc::Void)),
        )
    }

    fn invoke(&self, _selector: u32, _args: Vec<Value>) -> Result<Value, RemoteFault> {
        Err(RemoteFault::new("C", "root cause")
            .wrapped("B", "intermediate")
            .wrapped("A", "surface failure")
            .with_frame("thrower::boom", "thrower.rs", 17))
    }
}

struct SharedServer {
    child: Arc<dyn RemoteServer>,
}

impl RemoteServer for SharedServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(
            RemoteInfo::new("test.Shared")
                .method(MethodInfo::new("get", Vec::new(), TypeDesc::Remote)),
        )
    }

    fn invoke(&self, _selector: u32, _args: Vec<Value>) -> Result<Value, RemoteFault> {
        Ok(Value::Remote(Remote::Server(self.child.clone())))
    }
}

struct ReverseServer;

impl RemoteServer for ReverseServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        Arc::new(
            RemoteInfo::new("test.Reverser").method(
                MethodInfo::new("swap4", Vec::new(), TypeDesc::Void).flags(MethodFlags::PIPE),
            ),
        )
    }

    fn invoke(&self, selector: u32, _args: Vec<Value>) -> Result<Value, RemoteFault> {
        Err(RemoteFault::new("test.Bad", format!("selector {selector}")))
    }

    fn invoke_pipe(
        &self,
        _selector: u32,
        _args: Vec<Value>,
        pipe: &mut Pipe,
    ) -> Result<(), RemoteFault> {
        let mut buf = [0u8; 4];
        pipe.read_exact(&mut buf)
            .map_err(|e| RemoteFault::new("test.PipeRead", e.to_string()))?;
        buf.reverse();
        pipe.write_all(&buf)
            .map_err(|e| RemoteFault::new("test.PipeWrite", e.to_string()))?;
        pipe.flush()
            .map_err(|e| RemoteFault::new("test.PipeFlush", e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn echo_round_trip_and_no_skeleton_leak() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export("echo", Arc::new(EchoServer));

    let echo = a.lookup("echo").unwrap();
    let reply = echo.call(0, vec![Value::from("hello")]).unwrap();
    assert_eq!(reply, Value::from("hello"));

    // Admin plus the echo skeleton.
    assert_eq!(b.skeleton_count(), 2);

    drop(echo);
    // After one quiescent heartbeat window the exported skeleton is gone.
    assert!(
        eventually(Duration::from_secs(3), || b.skeleton_count() == 1),
        "skeleton count stayed at {}",
        b.skeleton_count()
    );

    a.close();
    b.close();
}

#[test]
fn shared_object_exchange() {
    let (a, b) = session_pair(test_config(), test_config());

    a.send(Value::from("from-a")).unwrap();
    b.send(Value::from("from-b")).unwrap();

    assert_eq!(b.receive().unwrap(), Value::from("from-a"));
    assert_eq!(a.receive().unwrap(), Value::from("from-b"));

    a.close();
    b.close();
}

#[test]
fn timeout_raises_promptly_and_call_path_recovers() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export("sleeper", Arc::new(SleepServer { millis: 800 }));
    b.export("echo", Arc::new(EchoServer));

    let sleeper = a.lookup("sleeper").unwrap();
    let start = Instant::now();
    let err = sleeper
        .call_timed(0, Vec::new(), Some(Duration::from_millis(60)))
        .unwrap_err();
    let elapsed = start.elapsed();

    match err {
        CallError::Timeout(d) => assert_eq!(d, Duration::from_millis(60)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(
        elapsed >= Duration::from_millis(60),
        "timer fired early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(600),
        "timeout took {elapsed:?}"
    );

    // The broken channel was discarded, not pooled; new calls work.
    let echo = a.lookup("echo").unwrap();
    assert_eq!(
        echo.call(0, vec![Value::from("after")]).unwrap(),
        Value::from("after")
    );

    a.close();
    b.close();
}

#[test]
fn asynchronous_call_reports_through_completion() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export("adder", Arc::new(AdderServer));

    let adder = a.lookup("adder").unwrap();
    let completion = adder
        .call_async(0, vec![Value::Int(20), Value::Int(22)])
        .unwrap();

    let result = completion
        .wait_timeout(Duration::from_secs(3))
        .expect("completion should settle");
    assert_eq!(result.unwrap(), Value::Int(42));

    a.close();
    b.close();
}

#[test]
fn batched_calls_preserve_program_order() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export(
        "recorder",
        Arc::new(RecorderServer {
            seen: Mutex::new(Vec::new()),
        }),
    );

    let recorder = a.lookup("recorder").unwrap();
    for n in 1..=5 {
        recorder.call(0, vec![Value::Int(n)]).unwrap();
    }
    // The closing non-batched call transmits the queue and runs last.
    let order = recorder.call(1, Vec::new()).unwrap();
    assert_eq!(
        order,
        Value::List((1..=5).map(Value::Int).collect::<Vec<_>>())
    );

    a.close();
    b.close();
}

#[test]
fn batched_creation_yields_usable_stubs_after_flush() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export(
        "factory",
        Arc::new(FactoryServer {
            minted: AtomicUsize::new(0),
        }),
    );

    let factory = a.lookup("factory").unwrap();
    let children: Vec<_> = (0..4)
        .map(|_| {
            factory
                .call_batched_remote(0, Vec::new(), child_info())
                .unwrap()
        })
        .collect();

    a.flush().unwrap();

    let mut names: Vec<String> = children
        .iter()
        .map(|child| {
            child
                .call(0, Vec::new())
                .unwrap()
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["child-0", "child-1", "child-2", "child-3"]);

    a.close();
    b.close();
}

#[test]
fn fault_chain_travels_with_addresses_and_pruned_trace() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export("thrower", Arc::new(ThrowServer));

    let thrower = a.lookup("thrower").unwrap();
    let err = thrower.call(0, Vec::new()).unwrap_err();

    let fault = match err {
        CallError::Remote(fault) => fault,
        other => panic!("expected remote fault, got {other:?}"),
    };

    assert_eq!(fault.head().type_name, "A");
    assert_eq!(fault.head().message.as_deref(), Some("surface failure"));
    assert_eq!(fault.chain_len(), 3);
    let causes: Vec<_> = fault.causes().map(|c| c.type_name.clone()).collect();
    assert_eq!(causes, vec!["B", "C"]);

    assert!(fault.local_address.is_some());
    assert!(fault.remote_address.is_some());
    for entry in std::iter::once(fault.head()).chain(fault.causes()) {
        assert!(entry.trace.iter().all(|f| f.file != "skeleton.rs"));
    }

    a.close();
    b.close();
}

#[test]
fn concurrent_resolution_converges_on_one_stub() {
    let (a, b) = session_pair(test_config(), test_config());
    let child: Arc<dyn RemoteServer> = Arc::new(Child {
        name: "only".to_string(),
    });
    b.export("shared", Arc::new(SharedServer { child }));

    let shared = a.lookup("shared").unwrap();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let value = shared.call(0, Vec::new()).unwrap();
                match value {
                    Value::Remote(Remote::Stub(stub)) => stub,
                    other => panic!("expected stub, got {other:?}"),
                }
            })
        })
        .collect();

    let stubs: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    for stub in &stubs[1..] {
        assert!(stub.ptr_eq(&stubs[0]), "stub instances diverged");
        assert_eq!(stub.object_id(), stubs[0].object_id());
    }

    a.close();
    b.close();
}

#[test]
fn close_cascades_to_in_flight_calls_and_peer() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export("sleeper", Arc::new(SleepServer { millis: 1500 }));

    let sleeper = a.lookup("sleeper").unwrap();
    let in_flight = {
        let sleeper = sleeper.clone();
        std::thread::spawn(move || sleeper.call(0, Vec::new()))
    };

    std::thread::sleep(Duration::from_millis(80));
    let closed_at = Instant::now();
    a.close();

    let err = in_flight.join().unwrap().unwrap_err();
    assert!(
        closed_at.elapsed() < Duration::from_millis(800),
        "in-flight call lingered"
    );
    match err {
        CallError::SessionClosed => {}
        other => panic!("expected session-closed, got {other:?}"),
    }

    // The peer observes the close notification and shuts down too.
    assert!(eventually(Duration::from_secs(2), || b.is_closed()));
}

#[test]
fn missing_heartbeats_close_the_session() {
    // `a` expects a heartbeat within 200 ms, but `b` only sends every 15 s.
    let slow = SessionConfig {
        heartbeat_interval: Duration::from_secs(30),
        ..SessionConfig::default()
    };
    let (a, b) = session_pair(test_config(), slow);

    assert!(
        eventually(Duration::from_secs(3), || a.is_closed()),
        "session survived without heartbeats"
    );

    b.close();
}

#[test]
fn proactive_dispose_tombstones_and_unexports() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export("echo", Arc::new(EchoServer));

    let echo = a.lookup("echo").unwrap();
    echo.call(0, vec![Value::from("x")]).unwrap();
    assert_eq!(b.skeleton_count(), 2);

    a.dispose(&echo).unwrap();

    match echo.call(0, vec![Value::from("y")]) {
        Err(CallError::NoSuchObject(id)) => assert_eq!(id, echo.object_id()),
        other => panic!("expected no-such-object, got {other:?}"),
    }
    assert!(eventually(Duration::from_secs(2), || b.skeleton_count() == 1));

    a.close();
    b.close();
}

#[test]
fn lookup_of_unknown_name_fails() {
    let (a, b) = session_pair(test_config(), test_config());

    match a.lookup("nothing-here") {
        Err(CallError::Remote(fault)) => {
            assert_eq!(fault.head().type_name, "tether.NoSuchExport");
        }
        other => panic!("expected lookup failure, got {other:?}"),
    }

    a.close();
    b.close();
}

#[test]
fn pipe_carries_raw_bytes_and_recycles_the_channel() {
    let (a, b) = session_pair(test_config(), test_config());
    b.export("reverser", Arc::new(ReverseServer));
    b.export("echo", Arc::new(EchoServer));

    let reverser = a.lookup("reverser").unwrap();
    let mut pipe = reverser.call_pipe(0, Vec::new()).unwrap();

    pipe.write_all(b"abcd").unwrap();
    pipe.flush().unwrap();
    let mut buf = [0u8; 4];
    pipe.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"dcba");

    pipe.close().unwrap();
    drop(pipe);

    // The channel survived the pipe and the session keeps working.
    let echo = a.lookup("echo").unwrap();
    assert_eq!(
        echo.call(0, vec![Value::from("still alive")]).unwrap(),
        Value::from("still alive")
    );

    a.close();
    b.close();
}
