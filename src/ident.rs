//! Identifiers and the per-session object registries.
//!
//! An identifier is an opaque 16-byte value; the same identifier on both
//! peers names the same object. Each binding of an identifier carries two
//! version counters: `local_version` increments whenever this side mints a
//! new binding for the identifier, and `remote_version` records the latest
//! version observed from the peer. A version change tells a peer that the
//! other side has re-bound the identifier (say, after an interface upgrade)
//! so cached metadata keyed by it must be invalidated.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::info::RemoteInfo;
use crate::skeleton::Skeleton;
use crate::stub::{StubFactory, StubState};
use crate::wire::{InvocationInput, InvocationOutput};

/// Globally unique 16-byte identifier. Equality and hashing consider the
/// bytes alone; version counters live on the binding, not the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Mint a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub(crate) fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut InvocationOutput<W>) -> io::Result<()> {
        out.write_bytes(self.as_bytes())
    }

    pub(crate) fn read_from<R: Read>(inp: &mut InvocationInput<R>) -> io::Result<Self> {
        let mut bytes = [0u8; 16];
        inp.read_bytes(&mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier plus both version counters, as exchanged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionedId {
    pub id: ObjectId,
    pub local_version: u32,
    pub remote_version: u32,
}

impl VersionedId {
    pub fn write_to<W: Write>(&self, out: &mut InvocationOutput<W>) -> io::Result<()> {
        self.id.write_to(out)?;
        out.write_varuint(self.local_version)?;
        out.write_varuint(self.remote_version)
    }

    pub fn read_from<R: Read>(inp: &mut InvocationInput<R>) -> io::Result<Self> {
        let id = ObjectId::read_from(inp)?;
        let local_version = inp.read_varuint()?;
        let remote_version = inp.read_varuint()?;
        Ok(Self {
            id,
            local_version,
            remote_version,
        })
    }
}

// ---------------------------------------------------------------------------
// Skeleton registry (strong table)
// ---------------------------------------------------------------------------

struct SkeletonBinding {
    skeleton: Arc<Skeleton>,
    local_version: u32,
    remote_version: u32,
}

#[derive(Default)]
struct SkeletonTables {
    by_id: HashMap<ObjectId, SkeletonBinding>,
    /// Identity interning: address of the server object to its identifier,
    /// so repeated serialization of the same object reuses one binding.
    by_identity: HashMap<usize, ObjectId>,
    /// Live skeleton count per type identifier. When a type's count returns
    /// to zero its metadata mapping is evicted, so a later first use sends
    /// `RemoteInfo` again.
    type_counts: HashMap<ObjectId, u32>,
}

/// Strong table of server-side skeletons. Entries live until explicit
/// dispose or session close.
pub(crate) struct SkeletonRegistry {
    inner: Mutex<SkeletonTables>,
}

pub(crate) struct Identified {
    pub skeleton: Arc<Skeleton>,
    pub local_version: u32,
    /// True when this serialization is the first use of the skeleton's type
    /// on this session, meaning `RemoteInfo` should ride along.
    pub first_use_of_type: bool,
}

impl SkeletonRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SkeletonTables::default()),
        }
    }

    /// Intern a server object, creating a skeleton binding on first sight.
    /// The same object identity always yields the same identifier.
    pub fn identify(
        &self,
        identity: usize,
        make: impl FnOnce(ObjectId) -> Arc<Skeleton>,
    ) -> Identified {
        let mut tables = self.inner.lock();

        if let Some(&id) = tables.by_identity.get(&identity) {
            if let Some(binding) = tables.by_id.get(&id) {
                return Identified {
                    skeleton: binding.skeleton.clone(),
                    local_version: binding.local_version,
                    first_use_of_type: false,
                };
            }
        }

        let id = ObjectId::random();
        let skeleton = make(id);
        let type_id = skeleton.type_id;
        let count = tables.type_counts.entry(type_id).or_insert(0);
        *count += 1;
        let first_use_of_type = *count == 1;

        tables.by_identity.insert(identity, id);
        tables.by_id.insert(
            id,
            SkeletonBinding {
                skeleton: skeleton.clone(),
                local_version: 1,
                remote_version: 0,
            },
        );

        Identified {
            skeleton,
            local_version: 1,
            first_use_of_type,
        }
    }

    /// Associate a skeleton with a caller-chosen identifier, as batched
    /// calls returning remotes do. Re-binding an identifier bumps its local
    /// version.
    pub fn register_with_id(&self, id: ObjectId, skeleton: Arc<Skeleton>) -> Arc<Skeleton> {
        let mut guard = self.inner.lock();
        let tables = &mut *guard;
        let type_id = skeleton.type_id;

        match tables.by_id.get_mut(&id) {
            Some(binding) if Arc::ptr_eq(&binding.skeleton, &skeleton) => binding.skeleton.clone(),
            Some(binding) => {
                binding.skeleton = skeleton.clone();
                binding.local_version += 1;
                tables.by_identity.insert(skeleton.identity, id);
                skeleton
            }
            None => {
                *tables.type_counts.entry(type_id).or_insert(0) += 1;
                tables.by_identity.insert(skeleton.identity, id);
                tables.by_id.insert(
                    id,
                    SkeletonBinding {
                        skeleton: skeleton.clone(),
                        local_version: 1,
                        remote_version: 0,
                    },
                );
                skeleton
            }
        }
    }

    pub fn try_retrieve(&self, id: ObjectId) -> Option<Arc<Skeleton>> {
        self.inner.lock().by_id.get(&id).map(|b| b.skeleton.clone())
    }

    pub fn update_remote_version(&self, id: ObjectId, v: u32) {
        if let Some(binding) = self.inner.lock().by_id.get_mut(&id) {
            binding.remote_version = v;
        }
    }

    /// Remove a skeleton. Returns it and whether its type count dropped to
    /// zero, in which case the caller evicts the type metadata.
    pub fn unexport(&self, id: ObjectId) -> Option<(Arc<Skeleton>, bool)> {
        let mut tables = self.inner.lock();
        let binding = tables.by_id.remove(&id)?;
        let identity = binding.skeleton.identity;
        tables.by_identity.remove(&identity);

        let type_id = binding.skeleton.type_id;
        let mut type_empty = false;
        if let Some(count) = tables.type_counts.get_mut(&type_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                tables.type_counts.remove(&type_id);
                type_empty = true;
            }
        }
        Some((binding.skeleton, type_empty))
    }

    pub fn count(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn clear(&self) {
        let mut tables = self.inner.lock();
        tables.by_id.clear();
        tables.by_identity.clear();
        tables.type_counts.clear();
    }
}

// ---------------------------------------------------------------------------
// Stub registry (weak table)
// ---------------------------------------------------------------------------

struct StubBinding {
    stub: Weak<StubState>,
    local_version: u32,
    remote_version: u32,
}

/// Weak table of local stubs for remote objects. An entry's lifetime ends
/// when the application drops its last reference; the drop queue observes
/// that and the reclamation task finishes the removal.
pub(crate) struct StubRegistry {
    inner: Mutex<HashMap<ObjectId, StubBinding>>,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_live(&self, id: ObjectId) -> Option<Arc<StubState>> {
        self.inner.lock().get(&id).and_then(|b| b.stub.upgrade())
    }

    /// Associate a stub with an identifier. If a live stub is already
    /// registered, that one wins and is returned, so concurrent
    /// deserializations of the same remote converge on a single instance.
    /// The losing candidate is neutralized so its drop never reports the
    /// identifier as unreferenced.
    pub fn register(
        &self,
        id: ObjectId,
        stub: Arc<StubState>,
        remote_version: u32,
    ) -> Arc<StubState> {
        let mut inner = self.inner.lock();
        match inner.get_mut(&id) {
            Some(binding) => {
                binding.remote_version = remote_version;
                if let Some(existing) = binding.stub.upgrade() {
                    drop(inner);
                    stub.dispose_tombstone();
                    existing
                } else {
                    binding.stub = Arc::downgrade(&stub);
                    binding.local_version += 1;
                    stub
                }
            }
            None => {
                inner.insert(
                    id,
                    StubBinding {
                        stub: Arc::downgrade(&stub),
                        local_version: 1,
                        remote_version,
                    },
                );
                stub
            }
        }
    }

    /// Both version counters for a binding, zero when unknown.
    pub fn versions(&self, id: ObjectId) -> (u32, u32) {
        self.inner
            .lock()
            .get(&id)
            .map_or((0, 0), |b| (b.local_version, b.remote_version))
    }

    /// Record the peer's latest version for an identifier. Returns true when
    /// the value changed, in which case cached type metadata keyed by the
    /// identifier must be invalidated.
    pub fn update_remote_version(&self, id: ObjectId, v: u32) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(&id) {
            Some(binding) if binding.remote_version != v => {
                binding.remote_version = v;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: ObjectId) -> Option<Arc<StubState>> {
        self.inner.lock().remove(&id).and_then(|b| b.stub.upgrade())
    }

    /// Drop every binding, returning the stubs still alive so the session
    /// can tombstone them.
    pub fn clear(&self) -> Vec<Arc<StubState>> {
        let mut inner = self.inner.lock();
        let live = inner.values().filter_map(|b| b.stub.upgrade()).collect();
        inner.clear();
        live
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Type registry (strong table)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct TypeBinding {
    pub info: Arc<RemoteInfo>,
    pub stub_factory: Arc<dyn StubFactory>,
}

/// Strong table of type descriptors and their stub factories, keyed by the
/// deterministic type identifier.
pub(crate) struct TypeRegistry {
    inner: Mutex<HashMap<ObjectId, TypeBinding>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register type metadata; an existing binding wins.
    pub fn register(
        &self,
        type_id: ObjectId,
        info: Arc<RemoteInfo>,
        stub_factory: Arc<dyn StubFactory>,
    ) -> TypeBinding {
        let mut inner = self.inner.lock();
        inner
            .entry(type_id)
            .or_insert(TypeBinding { info, stub_factory })
            .clone()
    }

    pub fn try_retrieve(&self, type_id: ObjectId) -> Option<TypeBinding> {
        self.inner.lock().get(&type_id).cloned()
    }

    pub fn evict(&self, type_id: ObjectId) {
        self.inner.lock().remove(&type_id);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubState;
    use crate::wire::{InvocationInput, InvocationOutput};

    #[test]
    fn versioned_id_round_trips() {
        let vid = VersionedId {
            id: ObjectId::random(),
            local_version: 3,
            remote_version: 9,
        };

        let mut out = InvocationOutput::new(Vec::new());
        vid.write_to(&mut out).unwrap();
        let buf = out.get_mut().clone();
        let mut inp = InvocationInput::new(buf.as_slice());
        let got = VersionedId::read_from(&mut inp).unwrap();

        assert_eq!(got, vid);
        assert_eq!(got.id, vid.id);
    }

    #[test]
    fn distinct_random_ids() {
        assert_ne!(ObjectId::random(), ObjectId::random());
    }

    fn detached_stub(id: ObjectId) -> Arc<StubState> {
        StubState::new(
            id,
            ObjectId::random(),
            Arc::new(RemoteInfo::new("test.Detached")),
            Weak::new(),
        )
    }

    #[test]
    fn stub_register_converges_on_first_live_binding() {
        let registry = StubRegistry::new();
        let id = ObjectId::random();

        let first = detached_stub(id);
        let second = detached_stub(id);

        let winner1 = registry.register(id, first.clone(), 1);
        let winner2 = registry.register(id, second, 1);
        assert!(Arc::ptr_eq(&winner1, &winner2));
        assert!(Arc::ptr_eq(&winner1, &first));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn stub_rebinding_bumps_local_version() {
        let registry = StubRegistry::new();
        let id = ObjectId::random();

        {
            let stub = detached_stub(id);
            registry.register(id, stub, 1);
            assert_eq!(registry.versions(id), (1, 1));
            // The only strong reference drops here.
        }

        let replacement = detached_stub(id);
        registry.register(id, replacement, 2);
        let (local, remote) = registry.versions(id);
        assert_eq!(local, 2, "re-binding a dead entry mints a new version");
        assert_eq!(remote, 2);
    }

    #[test]
    fn remote_version_updates_report_changes() {
        let registry = StubRegistry::new();
        let id = ObjectId::random();
        let stub = detached_stub(id);
        registry.register(id, stub, 1);

        assert!(!registry.update_remote_version(id, 1));
        assert!(registry.update_remote_version(id, 2));
        assert!(!registry.update_remote_version(id, 2));
    }
}
