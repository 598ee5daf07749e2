//! Serializable descriptions of remote interfaces.
//!
//! A `RemoteInfo` is deterministic for a given interface: the canonical
//! encoding doubles as the input of the name-based type identifier, so both
//! peers derive the same 16-byte id for the same description. Method order
//! is significant; a method's selector is its index.

use std::io::{self, Read, Write};
use std::sync::Arc;

use bitflags::bitflags;
use uuid::Uuid;

use crate::ident::ObjectId;
use crate::wire::{invalid_data, InvocationInput, InvocationOutput, TAG_NOT_NULL, TAG_NULL};

/// Namespace for deriving type identifiers from canonical descriptions.
const TYPE_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x0c, 0x6f, 0x25, 0x91, 0x5e, 0x4f, 0xd1, 0x9c, 0x3a, 0x54, 0x21, 0x7e, 0x88, 0x40,
    0x2d,
]);

bitflags! {
    /// Modifier flags on a remote method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u8 {
        /// Fire and forget: the caller does not read a response, and the
        /// callee's channel is released before the body runs.
        const ASYNCHRONOUS = 1 << 0;
        /// Request is buffered on the thread's pinned channel and shipped
        /// with the next non-batched call or explicit flush.
        const BATCHED = 1 << 1;
        /// A successful return unexports the receiver's skeleton.
        const DISPOSER = 1 << 2;
        /// Dispatch order among calls of this method is significant.
        const ORDERED = 1 << 3;
        /// The stub appends a completion callback argument and returns a
        /// future; the skeleton fulfils the callback.
        const COMPLETION = 1 << 4;
        /// The call hands both ends a raw byte pipe carved from the channel.
        const PIPE = 1 << 5;
        /// The call runs outside any pending batch, which is detached and
        /// restored around it instead of being resolved.
        const UNBATCHED = 1 << 6;
    }
}

/// Coarse parameter and return shapes. The value model is self-describing,
/// so these exist for documentation and the deterministic hash rather than
/// wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDesc {
    Void,
    Any,
    Bool,
    Int,
    Float,
    Bytes,
    Str,
    List,
    Map,
    Remote,
    Fault,
}

impl TypeDesc {
    fn to_wire(self) -> u8 {
        match self {
            TypeDesc::Void => 0,
            TypeDesc::Any => 1,
            TypeDesc::Bool => 2,
            TypeDesc::Int => 3,
            TypeDesc::Float => 4,
            TypeDesc::Bytes => 5,
            TypeDesc::Str => 6,
            TypeDesc::List => 7,
            TypeDesc::Map => 8,
            TypeDesc::Remote => 9,
            TypeDesc::Fault => 10,
        }
    }

    fn from_wire(tag: u8) -> io::Result<Self> {
        Ok(match tag {
            0 => TypeDesc::Void,
            1 => TypeDesc::Any,
            2 => TypeDesc::Bool,
            3 => TypeDesc::Int,
            4 => TypeDesc::Float,
            5 => TypeDesc::Bytes,
            6 => TypeDesc::Str,
            7 => TypeDesc::List,
            8 => TypeDesc::Map,
            9 => TypeDesc::Remote,
            10 => TypeDesc::Fault,
            other => return Err(invalid_data(format!("invalid type tag {other}"))),
        })
    }
}

/// Descriptor of one remote method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub name: String,
    pub params: Vec<TypeDesc>,
    pub returns: TypeDesc,
    pub flags: MethodFlags,
    /// Default call timeout in milliseconds. Negative means infinite, zero
    /// means already expired (one best-effort attempt is still made).
    pub timeout_millis: Option<i64>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, params: Vec<TypeDesc>, returns: TypeDesc) -> Self {
        Self {
            name: name.into(),
            params,
            returns,
            flags: MethodFlags::empty(),
            timeout_millis: None,
        }
    }

    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn timeout_millis(mut self, millis: i64) -> Self {
        self.timeout_millis = Some(millis);
        self
    }
}

/// Serializable description of a remote interface.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInfo {
    /// Fully qualified interface name.
    pub name: String,
    /// Super-interface names.
    pub interfaces: Vec<String>,
    /// Method descriptors; a method's selector is its index here.
    pub methods: Vec<MethodInfo>,
    /// Interface-wide default timeout, overridden per method or per call.
    pub default_timeout_millis: Option<i64>,
}

impl RemoteInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            methods: Vec::new(),
            default_timeout_millis: None,
        }
    }

    pub fn extends(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    pub fn method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn default_timeout_millis(mut self, millis: i64) -> Self {
        self.default_timeout_millis = Some(millis);
        self
    }

    pub fn get(&self, selector: u32) -> Option<&MethodInfo> {
        self.methods.get(selector as usize)
    }

    /// Effective timeout for a method: method default, then interface
    /// default.
    pub(crate) fn timeout_for(&self, selector: u32) -> Option<i64> {
        self.get(selector)
            .and_then(|m| m.timeout_millis)
            .or(self.default_timeout_millis)
    }

    /// Deterministic identifier of this description: the same description
    /// yields the same id on both peers.
    pub fn type_id(&self) -> ObjectId {
        let mut canonical = InvocationOutput::new(Vec::new());
        self.write_to(&mut canonical)
            .expect("writing to a vec cannot fail");
        let bytes = std::mem::take(canonical.get_mut());
        ObjectId::from_uuid(Uuid::new_v5(&TYPE_ID_NAMESPACE, &bytes))
    }

    fn write_opt_millis<W: Write>(
        out: &mut InvocationOutput<W>,
        millis: Option<i64>,
    ) -> io::Result<()> {
        match millis {
            None => out.write_u8(TAG_NULL),
            Some(v) => {
                out.write_u8(TAG_NOT_NULL)?;
                out.write_i64(v)
            }
        }
    }

    fn read_opt_millis<R: Read>(inp: &mut InvocationInput<R>) -> io::Result<Option<i64>> {
        match inp.read_u8()? {
            TAG_NULL => Ok(None),
            TAG_NOT_NULL => Ok(Some(inp.read_i64()?)),
            other => Err(invalid_data(format!("invalid timeout tag {other}"))),
        }
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut InvocationOutput<W>) -> io::Result<()> {
        out.write_string(&self.name)?;
        Self::write_opt_millis(out, self.default_timeout_millis)?;

        out.write_varuint(self.interfaces.len() as u32)?;
        for iface in &self.interfaces {
            out.write_string(iface)?;
        }

        out.write_varuint(self.methods.len() as u32)?;
        for m in &self.methods {
            out.write_string(&m.name)?;
            out.write_u8(m.flags.bits())?;
            Self::write_opt_millis(out, m.timeout_millis)?;
            out.write_varuint(m.params.len() as u32)?;
            for p in &m.params {
                out.write_u8(p.to_wire())?;
            }
            out.write_u8(m.returns.to_wire())?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(inp: &mut InvocationInput<R>) -> io::Result<Self> {
        let name = inp.read_string()?;
        let default_timeout_millis = Self::read_opt_millis(inp)?;

        let iface_count = inp.read_varuint()?;
        let mut interfaces = Vec::with_capacity(iface_count.min(64) as usize);
        for _ in 0..iface_count {
            interfaces.push(inp.read_string()?);
        }

        let method_count = inp.read_varuint()?;
        let mut methods = Vec::with_capacity(method_count.min(256) as usize);
        for _ in 0..method_count {
            let name = inp.read_string()?;
            let flags = MethodFlags::from_bits_truncate(inp.read_u8()?);
            let timeout_millis = Self::read_opt_millis(inp)?;
            let param_count = inp.read_varuint()?;
            let mut params = Vec::with_capacity(param_count.min(64) as usize);
            for _ in 0..param_count {
                params.push(TypeDesc::from_wire(inp.read_u8()?)?);
            }
            let returns = TypeDesc::from_wire(inp.read_u8()?)?;
            methods.push(MethodInfo {
                name,
                params,
                returns,
                flags,
                timeout_millis,
            });
        }

        Ok(Self {
            name,
            interfaces,
            methods,
            default_timeout_millis,
        })
    }

    /// Canonical byte encoding, used when the description itself is a call
    /// argument (the admin's remote-info fetch).
    pub(crate) fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = InvocationOutput::new(Vec::new());
        self.write_to(&mut out).expect("writing to a vec cannot fail");
        std::mem::take(out.get_mut())
    }

    pub(crate) fn from_canonical_bytes(bytes: &[u8]) -> io::Result<Arc<Self>> {
        let mut inp = InvocationInput::new(bytes);
        Ok(Arc::new(Self::read_from(&mut inp)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RemoteInfo {
        RemoteInfo::new("example.Directory")
            .extends("example.Base")
            .default_timeout_millis(5_000)
            .method(MethodInfo::new(
                "list",
                vec![TypeDesc::Str],
                TypeDesc::List,
            ))
            .method(
                MethodInfo::new("touch", vec![TypeDesc::Str], TypeDesc::Void)
                    .flags(MethodFlags::ASYNCHRONOUS)
                    .timeout_millis(250),
            )
            .method(
                MethodInfo::new("open", vec![TypeDesc::Str], TypeDesc::Remote)
                    .flags(MethodFlags::BATCHED),
            )
    }

    #[test]
    fn round_trips_through_canonical_encoding() {
        let info = sample();
        let bytes = info.to_canonical_bytes();
        let got = RemoteInfo::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(*got, info);
    }

    #[test]
    fn type_id_is_deterministic_and_content_sensitive() {
        assert_eq!(sample().type_id(), sample().type_id());

        let mut other = sample();
        other.methods[0].name.push('2');
        assert_ne!(sample().type_id(), other.type_id());
    }

    #[test]
    fn timeout_resolution_prefers_method_over_interface() {
        let info = sample();
        assert_eq!(info.timeout_for(0), Some(5_000));
        assert_eq!(info.timeout_for(1), Some(250));
        assert_eq!(info.timeout_for(99), Some(5_000));
    }
}
