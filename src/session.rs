//! The session: top-level owner of channels, registries, and lifecycle.
//!
//! Two peers connected by a transport each construct a session. The
//! handshake exchanges hidden admin objects over one channel in each
//! direction, concurrently in separate tasks so neither side deadlocks
//! waiting for the other to speak first. After that, every remote
//! capability flows through values carrying remote references: exporting is
//! serializing a server object, importing is deserializing a stub.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::channel::{InvocationChannel, Request};
use crate::completion::{Completion, CompletionServer, WeakCompletion};
use crate::errors::CallError;
use crate::fault::RemoteFault;
use crate::ident::{ObjectId, SkeletonRegistry, StubRegistry, TypeRegistry, VersionedId};
use crate::info::{MethodFlags, MethodInfo, RemoteInfo, TypeDesc};
use crate::pool::ChannelPool;
use crate::reclaim;
use crate::scheduler::{ScheduledHandle, Scheduler};
use crate::skeleton::{
    self, BatchState, DispatchSkeletonFactory, RemoteServer, ServeFlow, SkeletonFactory,
};
use crate::stub::{self, DispatchStubFactory, Stub, StubFactory};
use crate::transport::{ChannelCloser, Transport};
use crate::value::{MarshalHooks, MarshalledRemote, Remote, Value};
use crate::wire::invalid_data;

/// Tunables for a session. The defaults are the production constants;
/// tests shrink the heartbeat to keep scenarios fast.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker thread cap for this session's scheduler.
    pub max_threads: usize,
    /// Soft cap on pooled idle channels.
    pub channel_cap: usize,
    /// Peer liveness interval H: we send every H/2 and expect the peer
    /// within H.
    pub heartbeat_interval: Duration,
    /// Disposal notifications are batched up to this many identifiers.
    pub dispose_batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_threads: 64,
            channel_cap: 8,
            heartbeat_interval: Duration::from_secs(30),
            dispose_batch_size: 100,
        }
    }
}

// Admin selectors. The admin interface is the hidden remote object each
// peer exposes to the other for lifecycle traffic.
pub(crate) const ADMIN_SET_REMOTE_SERVER: u32 = 0;
pub(crate) const ADMIN_GET_REMOTE_INFO: u32 = 1;
pub(crate) const ADMIN_DISPOSED: u32 = 2;
pub(crate) const ADMIN_DISPOSED_BATCH: u32 = 3;
pub(crate) const ADMIN_HEARTBEAT: u32 = 4;
pub(crate) const ADMIN_CLOSED: u32 = 5;
pub(crate) const ADMIN_LOOKUP: u32 = 6;

fn admin_remote_info() -> Arc<RemoteInfo> {
    Arc::new(
        RemoteInfo::new("tether.Admin")
            .method(MethodInfo::new(
                "set_remote_server",
                vec![TypeDesc::Any],
                TypeDesc::Void,
            ))
            .method(MethodInfo::new(
                "get_remote_info",
                vec![TypeDesc::Bytes],
                TypeDesc::Bytes,
            ))
            .method(MethodInfo::new(
                "disposed",
                vec![TypeDesc::Bytes],
                TypeDesc::Void,
            ))
            .method(MethodInfo::new(
                "disposed_batch",
                vec![TypeDesc::List],
                TypeDesc::Void,
            ))
            .method(
                MethodInfo::new("heartbeat", Vec::new(), TypeDesc::Void)
                    .flags(MethodFlags::ASYNCHRONOUS),
            )
            .method(
                MethodInfo::new("closed", Vec::new(), TypeDesc::Void)
                    .flags(MethodFlags::ASYNCHRONOUS),
            )
            .method(MethodInfo::new(
                "lookup",
                vec![TypeDesc::Str],
                TypeDesc::Remote,
            )),
    )
}

enum SharedSlot {
    Empty,
    Set(Value),
}

/// Internals shared by the public [`Session`] handle, stubs, and the
/// serving machinery.
pub(crate) struct SessionInner {
    self_weak: Weak<SessionInner>,
    config: SessionConfig,
    scheduler: Scheduler,
    transport: Arc<dyn Transport>,
    pub(crate) pool: ChannelPool,
    pub(crate) skeletons: SkeletonRegistry,
    pub(crate) stubs: StubRegistry,
    pub(crate) types: TypeRegistry,
    skeleton_factory: Arc<dyn SkeletonFactory>,
    stub_factory: Arc<dyn StubFactory>,
    admin: OnceLock<Stub>,
    exports: Mutex<HashMap<String, Remote>>,
    shared_slot: Mutex<SharedSlot>,
    shared_cv: Condvar,
    /// Guards the close sequence so it runs exactly once.
    close_started: AtomicBool,
    /// Set once teardown begins; new invocations are refused from here on.
    closing: AtomicBool,
    next_expected_heartbeat: Mutex<Instant>,
    drop_queue: Mutex<Vec<ObjectId>>,
    housekeeper: Mutex<Option<ScheduledHandle>>,
    /// Outstanding async futures, cancelled at close so waiters unblock.
    pending_completions: Mutex<Vec<WeakCompletion>>,
}

impl SessionInner {
    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn skeleton_factory(&self) -> &Arc<dyn SkeletonFactory> {
        &self.skeleton_factory
    }

    /// Identity of this session, keying the thread-pinned batch channel.
    pub(crate) fn session_key(&self) -> usize {
        self as *const SessionInner as usize
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn admin_stub(&self) -> Result<Stub, CallError> {
        self.admin.get().cloned().ok_or(CallError::SessionClosed)
    }

    pub(crate) fn acquire_channel(&self) -> Result<InvocationChannel, CallError> {
        if self.is_closing() {
            return Err(CallError::SessionClosed);
        }
        self.pool.acquire().map_err(|e| {
            if self.is_closing() {
                CallError::SessionClosed
            } else {
                CallError::Transport(e.to_string())
            }
        })
    }

    pub(crate) fn release_channel(&self, chan: InvocationChannel, reset: bool) {
        self.pool.release(chan, reset);
    }

    pub(crate) fn discard_channel(&self, chan: InvocationChannel) {
        self.pool.discard(chan);
    }

    /// Schedule a task that severs a channel when a call's timeout expires.
    pub(crate) fn schedule_disconnect(
        &self,
        closer: ChannelCloser,
        delay: Duration,
    ) -> Result<ScheduledHandle, CallError> {
        self.scheduler
            .schedule(delay, move || {
                debug!("call timeout expired; severing channel");
                closer.disconnect();
            })
            .map_err(CallError::from)
    }

    pub(crate) fn stub_versions(&self, id: ObjectId) -> (u32, u32) {
        self.stubs.versions(id)
    }

    pub(crate) fn heartbeat_received(&self) {
        *self.next_expected_heartbeat.lock() = Instant::now() + self.config.heartbeat_interval;
    }

    pub(crate) fn next_expected_heartbeat(&self) -> Instant {
        *self.next_expected_heartbeat.lock()
    }

    /// A stub lost its last reference; queue the identifier for the
    /// reclamation task and drain immediately at the batch threshold.
    pub(crate) fn stub_dropped(&self, id: ObjectId) {
        if self.is_closing() {
            return;
        }
        let len = {
            let mut queue = self.drop_queue.lock();
            queue.push(id);
            queue.len()
        };
        if len >= self.config.dispose_batch_size {
            if let Some(inner) = self.self_weak.upgrade() {
                let _ = self.scheduler.execute(move || reclaim::drain_disposed(&inner));
            }
        }
    }

    pub(crate) fn take_dropped(&self, max: usize) -> Vec<ObjectId> {
        let mut queue = self.drop_queue.lock();
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    /// Allocate a completion plus the local callback object whose single
    /// invocation settles it.
    pub(crate) fn create_completion(&self) -> (Completion, Remote) {
        let completion = Completion::new();
        let callback = Remote::Server(Arc::new(CompletionServer::new(completion.clone())));
        {
            let mut pending = self.pending_completions.lock();
            pending.retain(|weak| weak.upgrade().is_some_and(|c| !c.is_done()));
            pending.push(completion.downgrade());
        }
        (completion, callback)
    }

    /// Register a stub under a caller-assigned identifier for a batched
    /// call's pending result.
    pub(crate) fn register_tentative_stub(
        &self,
        tentative: ObjectId,
        returns: Arc<RemoteInfo>,
    ) -> Stub {
        let type_id = returns.type_id();
        self.types
            .register(type_id, returns.clone(), self.stub_factory.clone());
        let state =
            self.stub_factory
                .create_stub(tentative, type_id, returns, self.self_weak.clone());
        let winner = self.stubs.register(tentative, state, 0);
        Stub { state: winner }
    }

    /// Bind a skeleton under a peer-assigned identifier.
    pub(crate) fn bind_skeleton(&self, id: ObjectId, skel: Arc<crate::skeleton::Skeleton>) {
        self.skeletons.register_with_id(id, skel);
    }

    /// Remove a skeleton binding, evicting its type metadata when it was
    /// the last of its kind.
    pub(crate) fn unexport_skeleton(&self, id: ObjectId) {
        if let Some((skel, type_empty)) = self.skeletons.unexport(id) {
            if type_empty {
                self.types.evict(skel.type_id);
            }
        }
    }

    /// Peer-initiated disposal of an identifier.
    pub(crate) fn apply_disposed(&self, id: ObjectId) {
        self.unexport_skeleton(id);
        if let Some(state) = self.stubs.remove(id) {
            state.dispose_tombstone();
        }
    }

    /// Retire a stub after a successful disposer call; the peer has already
    /// unexported its skeleton.
    pub(crate) fn retire_stub(&self, stub: &Stub) {
        stub.state.dispose_tombstone();
        self.stubs.remove(stub.object_id());
    }

    /// Proactive disposal: tombstone locally and tell the peer.
    pub(crate) fn dispose_stub(&self, stub: &Stub) -> Result<(), CallError> {
        stub.state.dispose_tombstone();
        self.stubs.remove(stub.object_id());
        let admin = self.admin_stub()?;
        admin
            .call(
                ADMIN_DISPOSED,
                vec![Value::Bytes(stub.object_id().as_bytes().to_vec())],
            )
            .map(|_| ())
    }

    /// Fetch type metadata from the peer admin, for a remote whose type was
    /// not carried inline.
    pub(crate) fn fetch_remote_info(&self, type_id: ObjectId) -> io::Result<Arc<RemoteInfo>> {
        let admin = self
            .admin_stub()
            .map_err(|e| invalid_data(format!("no admin link: {e}")))?;
        let reply = admin
            .call(
                ADMIN_GET_REMOTE_INFO,
                vec![Value::Bytes(type_id.as_bytes().to_vec())],
            )
            .map_err(|e| invalid_data(format!("remote info fetch failed: {e}")))?;
        match reply {
            Value::Bytes(bytes) => RemoteInfo::from_canonical_bytes(&bytes),
            other => Err(invalid_data(format!(
                "peer returned malformed remote info: {other:?}"
            ))),
        }
    }

    fn set_shared(&self, value: Value) {
        let mut slot = self.shared_slot.lock();
        *slot = SharedSlot::Set(value);
        self.shared_cv.notify_all();
    }

    fn receive_shared(&self, timeout: Option<Duration>) -> Result<Option<Value>, CallError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.shared_slot.lock();
        loop {
            if let SharedSlot::Set(value) = &*slot {
                return Ok(Some(value.clone()));
            }
            if self.is_closing() {
                return Err(CallError::SessionClosed);
            }
            match deadline {
                None => self.shared_cv.wait(&mut slot),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.shared_cv.wait_for(&mut slot, deadline - now);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Accept loop
    // ------------------------------------------------------------------

    fn spawn_accepter(self: &Arc<Self>) {
        let inner = self.clone();
        if self.scheduler.execute(move || accept_one(inner)).is_err() && !self.is_closing() {
            warn!("unable to spawn accepter; session cannot serve new channels");
        }
    }

    fn serve_channel(self: &Arc<Self>, mut chan: InvocationChannel) {
        let mut batch = BatchState::new();
        loop {
            let request = match chan.read_request() {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    if !self.is_closing() {
                        debug!(error = %e, "serving channel failed");
                    }
                    chan.disconnect();
                    return;
                }
            };

            let flow = match request {
                Request::Flush => skeleton::handle_flush(self, chan, &mut batch),
                Request::Call {
                    batched,
                    obj,
                    selector,
                } => {
                    self.skeletons.update_remote_version(obj.id, obj.local_version);
                    match self.skeletons.try_retrieve(obj.id) {
                        Some(skel) => skeleton::dispatch(self, chan, &mut batch, skel, selector, batched),
                        None => {
                            let fault = skeleton::no_such_object_fault(obj.id);
                            let _ = skeleton::write_fault_response(&mut chan, &fault);
                            chan.disconnect();
                            return;
                        }
                    }
                }
            };

            match flow {
                ServeFlow::Continue(c) => chan = c,
                ServeFlow::Stop => return,
            }
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Orderly shutdown. Runs at most once; later calls are no-ops.
    pub(crate) fn close_session(self: &Arc<Self>, notify_peer: bool) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(notify_peer, "closing session");

        // Tell the peer while channels still work. `closed` is one-way, so
        // this does not block on the peer's teardown.
        if notify_peer {
            if let Some(admin) = self.admin.get() {
                if let Err(e) = admin.call(ADMIN_CLOSED, Vec::new()) {
                    debug!(error = %e, "close notification did not reach peer");
                }
            }
        }

        self.closing.store(true, Ordering::SeqCst);

        if let Some(handle) = self.housekeeper.lock().take() {
            handle.cancel();
        }

        // Break every channel so in-flight calls and serving loops fail
        // promptly, then stop minting new ones.
        self.pool.disconnect_all();
        self.transport.close();
        self.scheduler.shutdown();

        self.skeletons.clear();
        self.types.clear();
        for state in self.stubs.clear() {
            state.mark_session_closed();
        }
        for weak in self.pending_completions.lock().drain(..) {
            if let Some(completion) = weak.upgrade() {
                completion.cancel();
            }
        }
        self.drop_queue.lock().clear();
        self.shared_cv.notify_all();
    }
}

fn accept_one(inner: Arc<SessionInner>) {
    let pair = match inner.transport.accept() {
        Ok(pair) => pair,
        Err(e) => {
            if !inner.is_closing() {
                error!(error = %e, "failure accepting channel; closing session");
                inner.close_session(true);
            }
            return;
        }
    };

    // Replace this accepter before dispatching, so a long call never
    // head-of-line blocks channel acceptance.
    inner.spawn_accepter();

    let chan = inner.pool.adopt(pair);
    inner.serve_channel(chan);
}

// ---------------------------------------------------------------------------
// Marshalling hooks
// ---------------------------------------------------------------------------

impl MarshalHooks for SessionInner {
    fn replace_remote(&self, remote: &Remote) -> io::Result<MarshalledRemote> {
        match remote {
            Remote::Stub(stub) => {
                // A stub refers back to an object the peer owns; no
                // metadata needs to travel.
                let (local_version, remote_version) = self.stubs.versions(stub.object_id());
                Ok(MarshalledRemote {
                    obj: VersionedId {
                        id: stub.object_id(),
                        local_version,
                        remote_version,
                    },
                    ty: VersionedId {
                        id: stub.state.type_id,
                        local_version: 0,
                        remote_version: 0,
                    },
                    info: None,
                })
            }
            Remote::Server(server) => {
                let identity = Arc::as_ptr(server) as *const () as usize;
                let factory = self.skeleton_factory.clone();
                let server = server.clone();
                let identified = self
                    .skeletons
                    .identify(identity, move |id| factory.create_skeleton(id, server));

                let skel = identified.skeleton;
                self.types
                    .register(skel.type_id, skel.info.clone(), self.stub_factory.clone());

                Ok(MarshalledRemote {
                    obj: VersionedId {
                        id: skel.id,
                        local_version: identified.local_version,
                        remote_version: 0,
                    },
                    ty: VersionedId {
                        id: skel.type_id,
                        local_version: 0,
                        remote_version: 0,
                    },
                    info: identified.first_use_of_type.then(|| skel.info.clone()),
                })
            }
        }
    }

    fn resolve_remote(&self, marshalled: MarshalledRemote) -> io::Result<Remote> {
        let obj_id = marshalled.obj.id;

        // The identifier may denote one of our own skeletons, in which case
        // the original object substitutes for the reference.
        if let Some(skel) = self.skeletons.try_retrieve(obj_id) {
            self.skeletons
                .update_remote_version(obj_id, marshalled.obj.local_version);
            return Ok(Remote::Server(skel.server.clone()));
        }

        let changed = self
            .stubs
            .update_remote_version(obj_id, marshalled.obj.local_version);
        if changed {
            // The peer re-bound the identifier; cached type metadata is
            // stale.
            self.types.evict(marshalled.ty.id);
        }

        if let Some(state) = self.stubs.get_live(obj_id) {
            return Ok(Remote::Stub(Stub { state }));
        }

        let type_id = marshalled.ty.id;
        let binding = match self.types.try_retrieve(type_id) {
            Some(binding) => binding,
            None => {
                let info = match marshalled.info {
                    Some(info) => info,
                    None => self.fetch_remote_info(type_id)?,
                };
                self.types.register(type_id, info, self.stub_factory.clone())
            }
        };

        let state = binding.stub_factory.create_stub(
            obj_id,
            type_id,
            binding.info.clone(),
            self.self_weak.clone(),
        );
        let winner = self
            .stubs
            .register(obj_id, state, marshalled.obj.local_version);
        Ok(Remote::Stub(Stub { state: winner }))
    }
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

struct AdminServer {
    session: Weak<SessionInner>,
}

fn value_to_id(value: &Value) -> Result<ObjectId, RemoteFault> {
    let bytes: [u8; 16] = value
        .as_bytes()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| RemoteFault::new("tether.BadIdentifier", "identifier must be 16 bytes"))?;
    Ok(ObjectId::from_bytes(bytes))
}

impl RemoteServer for AdminServer {
    fn remote_info(&self) -> Arc<RemoteInfo> {
        admin_remote_info()
    }

    fn invoke(&self, selector: u32, mut args: Vec<Value>) -> Result<Value, RemoteFault> {
        let Some(session) = self.session.upgrade() else {
            return Err(RemoteFault::new("tether.Closed", "session is gone"));
        };

        // Any admin traffic proves the peer alive.
        session.heartbeat_received();

        match selector {
            ADMIN_SET_REMOTE_SERVER => {
                let value = args.pop().unwrap_or(Value::Null);
                session.set_shared(value);
                Ok(Value::Null)
            }
            ADMIN_GET_REMOTE_INFO => {
                let id = value_to_id(args.first().unwrap_or(&Value::Null))?;
                match session.types.try_retrieve(id) {
                    Some(binding) => Ok(Value::Bytes(binding.info.to_canonical_bytes())),
                    None => Err(RemoteFault::new(
                        "tether.NoSuchObject",
                        format!("no type metadata for {id}"),
                    )),
                }
            }
            ADMIN_DISPOSED => {
                let id = value_to_id(args.first().unwrap_or(&Value::Null))?;
                session.apply_disposed(id);
                Ok(Value::Null)
            }
            ADMIN_DISPOSED_BATCH => {
                let ids = args.pop().unwrap_or(Value::Null);
                let Value::List(items) = ids else {
                    return Err(RemoteFault::new(
                        "tether.BadIdentifier",
                        "disposed batch must be a list",
                    ));
                };
                for item in &items {
                    session.apply_disposed(value_to_id(item)?);
                }
                Ok(Value::Null)
            }
            ADMIN_HEARTBEAT => Ok(Value::Null),
            ADMIN_CLOSED => {
                info!("peer closed the session");
                session.close_session(false);
                Ok(Value::Null)
            }
            ADMIN_LOOKUP => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        RemoteFault::new("tether.BadLookup", "lookup takes a string name")
                    })?
                    .to_string();
                let found = session.exports.lock().get(&name).cloned();
                match found {
                    Some(remote) => Ok(Value::Remote(remote)),
                    None => Err(RemoteFault::new(
                        "tether.NoSuchExport",
                        format!("nothing exported under {name:?}"),
                    )),
                }
            }
            other => Err(RemoteFault::new(
                "tether.NoSuchMethod",
                format!("unknown selector {other}"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Public session handle
// ---------------------------------------------------------------------------

/// A live session with one peer.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Establish a session over a transport. Both peers call this; the
    /// handshake is symmetric.
    pub fn connect(transport: impl Transport, config: SessionConfig) -> io::Result<Session> {
        Self::connect_shared(Arc::new(transport), config)
    }

    /// As [`Session::connect`] for an already-shared transport.
    pub fn connect_shared(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> io::Result<Session> {
        let scheduler = Scheduler::new("tether", config.max_threads);
        let heartbeat = config.heartbeat_interval;

        let inner = Arc::new_cyclic(|weak| SessionInner {
            self_weak: weak.clone(),
            pool: ChannelPool::new(transport.clone(), config.channel_cap),
            config,
            scheduler,
            transport,
            skeletons: SkeletonRegistry::new(),
            stubs: StubRegistry::new(),
            types: TypeRegistry::new(),
            skeleton_factory: Arc::new(DispatchSkeletonFactory),
            stub_factory: Arc::new(DispatchStubFactory),
            admin: OnceLock::new(),
            exports: Mutex::new(HashMap::new()),
            shared_slot: Mutex::new(SharedSlot::Empty),
            shared_cv: Condvar::new(),
            close_started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            next_expected_heartbeat: Mutex::new(Instant::now() + heartbeat),
            drop_queue: Mutex::new(Vec::new()),
            housekeeper: Mutex::new(None),
            pending_completions: Mutex::new(Vec::new()),
        });

        let admin_server: Arc<dyn RemoteServer> = Arc::new(AdminServer {
            session: Arc::downgrade(&inner),
        });

        // Transmit our admin in a separate task: the peer cannot accept our
        // channel until it has opened its own, so doing both on one thread
        // deadlocks instantly.
        let (tx, rx) = mpsc::channel();
        {
            let inner2 = inner.clone();
            inner
                .scheduler
                .execute(move || {
                    let _ = tx.send(send_admin(&inner2, admin_server));
                })
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }

        let admin_stub = accept_admin(&inner)?;
        let _ = inner.admin.set(admin_stub);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "handshake task vanished",
                ))
            }
        }

        inner.heartbeat_received();
        inner.spawn_accepter();
        let handle = reclaim::start(&inner)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        *inner.housekeeper.lock() = Some(handle);

        info!(
            local = %inner.transport.local_address(),
            remote = %inner.transport.remote_address(),
            "session established"
        );
        Ok(Session { inner })
    }

    /// Deposit the shared object on the peer.
    pub fn send(&self, value: Value) -> Result<(), CallError> {
        let admin = self.inner.admin_stub()?;
        admin.call(ADMIN_SET_REMOTE_SERVER, vec![value]).map(|_| ())
    }

    /// Wait for the shared object the peer deposits at handshake time.
    pub fn receive(&self) -> Result<Value, CallError> {
        match self.inner.receive_shared(None)? {
            Some(value) => Ok(value),
            None => Err(CallError::SessionClosed),
        }
    }

    /// As [`Session::receive`] with a bound; `None` when it elapses first.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Value>, CallError> {
        self.inner.receive_shared(Some(timeout))
    }

    /// Expose a server object to the peer under a name.
    pub fn export(&self, name: impl Into<String>, server: Arc<dyn RemoteServer>) {
        self.inner
            .exports
            .lock()
            .insert(name.into(), Remote::Server(server));
    }

    /// Obtain a proxy for an object the peer exported under a name.
    pub fn lookup(&self, name: &str) -> Result<Stub, CallError> {
        let admin = self.inner.admin_stub()?;
        let value = admin.call(ADMIN_LOOKUP, vec![Value::from(name)])?;
        match value {
            Value::Remote(Remote::Stub(stub)) => Ok(stub),
            other => Err(CallError::Marshal(format!(
                "lookup returned a non-stub value: {other:?}"
            ))),
        }
    }

    /// Proactively dispose a stub: the peer's skeleton is unexported and
    /// every later call through the stub fails with no-such-object.
    pub fn dispose(&self, stub: &Stub) -> Result<(), CallError> {
        self.inner.dispose_stub(stub)
    }

    /// Transmit and resolve the calling thread's pending batch, if any.
    pub fn flush(&self) -> Result<(), CallError> {
        let key = self.inner.session_key();
        match stub::take_thread_batch(key) {
            Some(batch) => stub::flush_batch(&self.inner, batch),
            None => Ok(()),
        }
    }

    /// Orderly shutdown: resolve this thread's batch, notify the peer,
    /// cancel scheduled work, break channels, drop all bindings.
    pub fn close(&self) {
        let _ = self.flush();
        self.inner.close_session(true);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closing()
    }

    pub fn local_address(&self) -> String {
        self.inner.transport.local_address()
    }

    pub fn remote_address(&self) -> String {
        self.inner.transport.remote_address()
    }

    /// Number of live skeletons, the admin included. Diagnostic.
    pub fn skeleton_count(&self) -> usize {
        self.inner.skeletons.count()
    }

    /// Number of stub bindings still registered. Diagnostic.
    pub fn stub_count(&self) -> usize {
        self.inner.stubs.count()
    }

    /// Number of idle pooled channels. Diagnostic.
    pub fn idle_channel_count(&self) -> usize {
        self.inner.pool.idle_count()
    }
}

fn send_admin(inner: &Arc<SessionInner>, admin: Arc<dyn RemoteServer>) -> io::Result<()> {
    let pair = inner.transport.connect()?;
    let mut chan = inner.pool.adopt(pair);
    chan.write_value(&Value::Remote(Remote::Server(admin)), &**inner)?;
    chan.flush()?;
    // The handshake channel has served its purpose; dropping it half-closes
    // the stream after the peer reads the admin reference.
    Ok(())
}

fn accept_admin(inner: &Arc<SessionInner>) -> io::Result<Stub> {
    let pair = inner.transport.accept()?;
    let mut chan = inner.pool.adopt(pair);
    let value = chan.read_value(&**inner)?;
    match value {
        Value::Remote(Remote::Stub(stub)) => Ok(stub),
        other => Err(invalid_data(format!(
            "handshake expected an admin reference, got {other:?}"
        ))),
    }
}
