//! Self-describing value model carried by invocations.
//!
//! Arguments, results, and the handshake payload all travel as [`Value`]
//! trees in a tagged, length-prefixed encoding. Every `write_value` document
//! starts with a flags byte whose low bit tells the reader to clear its
//! shared-string table, which is how a channel's output reset propagates
//! in-band. Strings are interned per channel and later occurrences become
//! back-references.
//!
//! Remote references are the one substitution point: on write a [`Remote`]
//! is replaced by its marshalled form through the session hooks, and on read
//! the marshalled form resolves to the local original (when the identifier
//! names a skeleton here) or to a stub built from the type's factory.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::fault::{read_fault, write_fault, RemoteFault};
use crate::ident::VersionedId;
use crate::info::RemoteInfo;
use crate::skeleton::RemoteServer;
use crate::stub::Stub;
use crate::wire::{invalid_data, InvocationInput, InvocationOutput, TAG_NOT_NULL, TAG_NULL};

const V_NULL: u8 = 0;
const V_FALSE: u8 = 1;
const V_TRUE: u8 = 2;
const V_INT: u8 = 3;
const V_FLOAT: u8 = 4;
const V_BYTES: u8 = 5;
const V_STR: u8 = 6;
const V_STR_REF: u8 = 7;
const V_LIST: u8 = 8;
const V_MAP: u8 = 9;
const V_FAULT: u8 = 10;
const V_REMOTE: u8 = 11;

/// Document flag: reader must clear its shared-string table first.
const F_RESET: u8 = 1;

/// A reference to a remote-capable object.
#[derive(Clone)]
pub enum Remote {
    /// A local server object; serializing it exports a skeleton.
    Server(Arc<dyn RemoteServer>),
    /// A proxy for an object owned by the peer.
    Stub(Stub),
}

impl Remote {
    pub fn server(server: impl RemoteServer + 'static) -> Self {
        Remote::Server(Arc::new(server))
    }

    pub fn as_stub(&self) -> Option<&Stub> {
        match self {
            Remote::Stub(stub) => Some(stub),
            Remote::Server(_) => None,
        }
    }
}

impl PartialEq for Remote {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Remote::Server(a), Remote::Server(b)) => Arc::ptr_eq(a, b),
            (Remote::Stub(a), Remote::Stub(b)) => a.object_id() == b.object_id(),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remote::Server(s) => write!(f, "Remote::Server({})", s.remote_info().name),
            Remote::Stub(s) => write!(f, "Remote::Stub({})", s.object_id()),
        }
    }
}

/// A value in an invocation's argument or result position.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Fault(Box<RemoteFault>),
    Remote(Remote),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Remote> {
        match self {
            Value::Remote(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<RemoteFault> for Value {
    fn from(v: RemoteFault) -> Self {
        Value::Fault(Box::new(v))
    }
}

impl From<Remote> for Value {
    fn from(v: Remote) -> Self {
        Value::Remote(v)
    }
}

/// A remote reference in its wire form.
#[derive(Debug, Clone)]
pub(crate) struct MarshalledRemote {
    pub obj: VersionedId,
    pub ty: VersionedId,
    /// Included only on the first cross-wire transmission of the type on
    /// this session, to save the metadata round trip.
    pub info: Option<Arc<RemoteInfo>>,
}

impl MarshalledRemote {
    fn write_to<W: Write>(&self, out: &mut InvocationOutput<W>) -> io::Result<()> {
        self.obj.write_to(out)?;
        self.ty.write_to(out)?;
        match &self.info {
            None => out.write_u8(TAG_NULL),
            Some(info) => {
                out.write_u8(TAG_NOT_NULL)?;
                info.write_to(out)
            }
        }
    }

    fn read_from<R: Read>(inp: &mut InvocationInput<R>) -> io::Result<Self> {
        let obj = VersionedId::read_from(inp)?;
        let ty = VersionedId::read_from(inp)?;
        let info = match inp.read_u8()? {
            TAG_NULL => None,
            TAG_NOT_NULL => Some(Arc::new(RemoteInfo::read_from(inp)?)),
            other => return Err(invalid_data(format!("invalid info tag {other}"))),
        };
        Ok(Self { obj, ty, info })
    }
}

/// Session-side substitution hooks for remote references.
pub(crate) trait MarshalHooks {
    fn replace_remote(&self, remote: &Remote) -> io::Result<MarshalledRemote>;
    fn resolve_remote(&self, marshalled: MarshalledRemote) -> io::Result<Remote>;
}

/// Hooks for contexts with no session, such as codec unit tests. Any remote
/// reference is a marshalling error.
#[cfg(test)]
pub(crate) struct NoRemotes;

#[cfg(test)]
impl MarshalHooks for NoRemotes {
    fn replace_remote(&self, _remote: &Remote) -> io::Result<MarshalledRemote> {
        Err(invalid_data("remote reference outside a session"))
    }

    fn resolve_remote(&self, _marshalled: MarshalledRemote) -> io::Result<Remote> {
        Err(invalid_data("remote reference outside a session"))
    }
}

/// Write one value document: flags byte, then the tagged tree.
pub(crate) fn write_value<W: Write>(
    out: &mut InvocationOutput<W>,
    value: &Value,
    hooks: &dyn MarshalHooks,
) -> io::Result<()> {
    let flags = if out.pending_reset {
        out.pending_reset = false;
        F_RESET
    } else {
        0
    };
    out.write_u8(flags)?;
    write_node(out, value, hooks)
}

fn write_node<W: Write>(
    out: &mut InvocationOutput<W>,
    value: &Value,
    hooks: &dyn MarshalHooks,
) -> io::Result<()> {
    match value {
        Value::Null => out.write_u8(V_NULL),
        Value::Bool(false) => out.write_u8(V_FALSE),
        Value::Bool(true) => out.write_u8(V_TRUE),
        Value::Int(v) => {
            out.write_u8(V_INT)?;
            out.write_i64(*v)
        }
        Value::Float(v) => {
            out.write_u8(V_FLOAT)?;
            out.write_f64(*v)
        }
        Value::Bytes(b) => {
            out.write_u8(V_BYTES)?;
            let len = u32::try_from(b.len()).map_err(|_| invalid_data("byte blob too long"))?;
            out.write_varuint(len)?;
            out.write_bytes(b)
        }
        Value::Str(s) => {
            if let Some(&idx) = out.interned.get(s) {
                out.write_u8(V_STR_REF)?;
                out.write_varuint(idx)
            } else {
                out.write_u8(V_STR)?;
                out.write_string(s)?;
                let idx = out.interned.len() as u32;
                out.interned.insert(s.clone(), idx);
                Ok(())
            }
        }
        Value::List(items) => {
            out.write_u8(V_LIST)?;
            out.write_varuint(items.len() as u32)?;
            for item in items {
                write_node(out, item, hooks)?;
            }
            Ok(())
        }
        Value::Map(entries) => {
            out.write_u8(V_MAP)?;
            out.write_varuint(entries.len() as u32)?;
            for (k, v) in entries {
                write_node(out, k, hooks)?;
                write_node(out, v, hooks)?;
            }
            Ok(())
        }
        Value::Fault(fault) => {
            out.write_u8(V_FAULT)?;
            // Addresses are stamped by the response path; inside a value
            // graph the fault travels unstamped.
            write_fault(out, Some(&**fault), "", "")
        }
        Value::Remote(remote) => {
            let marshalled = hooks.replace_remote(remote)?;
            out.write_u8(V_REMOTE)?;
            marshalled.write_to(out)
        }
    }
}

/// Read one value document written by [`write_value`].
pub(crate) fn read_value<R: Read>(
    inp: &mut InvocationInput<R>,
    hooks: &dyn MarshalHooks,
) -> io::Result<Value> {
    let flags = inp.read_u8()?;
    if flags & F_RESET != 0 {
        inp.interned.clear();
    }
    read_node(inp, hooks, 0)
}

const MAX_DEPTH: u32 = 64;

fn read_node<R: Read>(
    inp: &mut InvocationInput<R>,
    hooks: &dyn MarshalHooks,
    depth: u32,
) -> io::Result<Value> {
    if depth > MAX_DEPTH {
        return Err(invalid_data("value graph too deep"));
    }
    match inp.read_u8()? {
        V_NULL => Ok(Value::Null),
        V_FALSE => Ok(Value::Bool(false)),
        V_TRUE => Ok(Value::Bool(true)),
        V_INT => Ok(Value::Int(inp.read_i64()?)),
        V_FLOAT => Ok(Value::Float(inp.read_f64()?)),
        V_BYTES => {
            let len = inp.read_varuint()? as usize;
            let mut buf = vec![0u8; len];
            inp.read_bytes(&mut buf)?;
            Ok(Value::Bytes(buf))
        }
        V_STR => {
            let s = inp.read_string()?;
            inp.interned.push(s.clone());
            Ok(Value::Str(s))
        }
        V_STR_REF => {
            let idx = inp.read_varuint()? as usize;
            let s = inp
                .interned
                .get(idx)
                .ok_or_else(|| invalid_data(format!("bad string back-reference {idx}")))?;
            Ok(Value::Str(s.clone()))
        }
        V_LIST => {
            let len = inp.read_varuint()?;
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(read_node(inp, hooks, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        V_MAP => {
            let len = inp.read_varuint()?;
            let mut entries = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                let k = read_node(inp, hooks, depth + 1)?;
                let v = read_node(inp, hooks, depth + 1)?;
                entries.push((k, v));
            }
            Ok(Value::Map(entries))
        }
        V_FAULT => {
            let fault =
                read_fault(inp)?.ok_or_else(|| invalid_data("null fault inside value graph"))?;
            Ok(Value::Fault(Box::new(fault)))
        }
        V_REMOTE => {
            let marshalled = MarshalledRemote::read_from(inp)?;
            Ok(Value::Remote(hooks.resolve_remote(marshalled)?))
        }
        other => Err(invalid_data(format!("invalid value tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value) -> Value {
        let mut out = InvocationOutput::new(Vec::new());
        write_value(&mut out, value, &NoRemotes).unwrap();
        let buf = out.get_mut().clone();
        let mut inp = InvocationInput::new(buf.as_slice());
        read_value(&mut inp, &NoRemotes).unwrap()
    }

    #[test]
    fn scalar_values_round_trip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-7),
            Value::Int(i64::MAX),
            Value::Float(3.5),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Str("hello".into()),
        ] {
            assert_eq!(round_trip(&v), v);
        }
    }

    #[test]
    fn nested_graphs_round_trip() {
        let v = Value::Map(vec![
            (Value::Str("names".into()), Value::List(vec!["a".into(), "b".into()])),
            (
                Value::Str("attrs".into()),
                Value::Map(vec![(Value::Int(1), Value::Bool(true))]),
            ),
            (
                Value::Str("fault".into()),
                Value::from(RemoteFault::new("x.Err", "nope")),
            ),
        ]);
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn repeated_strings_become_back_references() {
        let one = {
            let mut out = InvocationOutput::new(Vec::new());
            write_value(&mut out, &Value::Str("shared-string".into()), &NoRemotes).unwrap();
            out.get_mut().len()
        };

        let mut out = InvocationOutput::new(Vec::new());
        write_value(&mut out, &Value::Str("shared-string".into()), &NoRemotes).unwrap();
        let after_first = out.get_mut().len();
        write_value(&mut out, &Value::Str("shared-string".into()), &NoRemotes).unwrap();
        let after_second = out.get_mut().len();

        assert_eq!(after_first, one);
        assert!(
            after_second - after_first < one,
            "second write should be a back-reference"
        );

        let buf = out.get_mut().clone();
        let mut inp = InvocationInput::new(buf.as_slice());
        assert_eq!(read_value(&mut inp, &NoRemotes).unwrap(), Value::Str("shared-string".into()));
        assert_eq!(read_value(&mut inp, &NoRemotes).unwrap(), Value::Str("shared-string".into()));
    }

    #[test]
    fn reset_clears_both_intern_tables() {
        let mut out = InvocationOutput::new(Vec::new());
        write_value(&mut out, &Value::Str("s".into()), &NoRemotes).unwrap();
        out.reset();
        // After a reset the same string is written inline again.
        write_value(&mut out, &Value::Str("s".into()), &NoRemotes).unwrap();
        write_value(&mut out, &Value::Str("s".into()), &NoRemotes).unwrap();

        let buf = out.get_mut().clone();
        let mut inp = InvocationInput::new(buf.as_slice());
        for _ in 0..3 {
            assert_eq!(read_value(&mut inp, &NoRemotes).unwrap(), Value::Str("s".into()));
        }
    }

    #[test]
    fn remote_outside_session_is_a_marshal_error() {
        let mut out = InvocationOutput::new(Vec::new());
        let err = write_value(
            &mut out,
            &Value::List(vec![Value::Null]),
            &NoRemotes,
        );
        assert!(err.is_ok());

        struct Nobody;
        impl RemoteServer for Nobody {
            fn remote_info(&self) -> Arc<RemoteInfo> {
                Arc::new(RemoteInfo::new("test.Nobody"))
            }
            fn invoke(
                &self,
                _selector: u32,
                _args: Vec<Value>,
            ) -> Result<Value, RemoteFault> {
                Ok(Value::Null)
            }
        }

        let err = write_value(&mut out, &Value::Remote(Remote::server(Nobody)), &NoRemotes)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
