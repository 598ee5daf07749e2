//! Fault transport: remote errors carried across the wire with address
//! stamping and pruned traces.
//!
//! A fault is written as the cause chain, root first, so a caller gets
//! something useful even when the head entry alone would have been enough.
//! Server-side trace frames are pruned at the skeleton dispatch frame before
//! transmission, which keeps internal dispatch plumbing out of peer logs.

use std::io::{self, Read, Write};
use std::sync::OnceLock;

use crate::wire::{invalid_data, InvocationInput, InvocationOutput, TAG_NOT_NULL, TAG_NULL};

/// File-name marker that ends a transmitted trace. Frames recorded below the
/// dispatch layer are the peer's internals, not the caller's business.
pub(crate) const DISPATCH_MARKER: &str = "skeleton.rs";

static PRUNE_TRACES: OnceLock<bool> = OnceLock::new();

/// Snapshot of the `TETHER_PRUNE_FAULT_TRACES` flag, consulted once.
pub(crate) fn prune_traces() -> bool {
    *PRUNE_TRACES.get_or_init(|| {
        std::env::var("TETHER_PRUNE_FAULT_TRACES")
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true)
    })
}

/// One frame of a transported trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// One entry in a fault's cause chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEntry {
    /// Name of the error type or condition, e.g. `"db.LockTimeout"`.
    pub type_name: String,
    pub message: Option<String>,
    pub trace: Vec<FaultFrame>,
}

/// An error thrown by a remote method, transported with the addresses of
/// both channel endpoints as observed by the throwing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    /// Address local to the peer that wrote the fault.
    pub local_address: Option<String>,
    /// Address of the reader, as the writer saw it.
    pub remote_address: Option<String>,
    /// Cause chain, root cause first. Never empty.
    chain: Vec<FaultEntry>,
}

impl RemoteFault {
    /// Create a fault with a single entry.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            local_address: None,
            remote_address: None,
            chain: vec![FaultEntry {
                type_name: type_name.into(),
                message: Some(message.into()),
                trace: Vec::new(),
            }],
        }
    }

    /// Wrap this fault in a new head entry; the existing head becomes its
    /// cause.
    pub fn wrapped(mut self, type_name: impl Into<String>, message: impl Into<String>) -> Self {
        self.chain.push(FaultEntry {
            type_name: type_name.into(),
            message: Some(message.into()),
            trace: Vec::new(),
        });
        self
    }

    /// Record a trace frame on the head entry.
    pub fn with_frame(
        mut self,
        function: impl Into<String>,
        file: impl Into<String>,
        line: u32,
    ) -> Self {
        if let Some(head) = self.chain.last_mut() {
            head.trace.push(FaultFrame {
                function: function.into(),
                file: file.into(),
                line,
            });
        }
        self
    }

    /// The outermost entry.
    pub fn head(&self) -> &FaultEntry {
        self.chain.last().expect("fault chain is never empty")
    }

    /// Cause chain from the head down to the root cause.
    pub fn causes(&self) -> impl Iterator<Item = &FaultEntry> {
        self.chain.iter().rev().skip(1)
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = self.head();
        write!(f, "{}", head.type_name)?;
        if let Some(msg) = &head.message {
            write!(f, ": {msg}")?;
        }
        for cause in self.causes() {
            write!(f, "; caused by {}", cause.type_name)?;
            if let Some(msg) = &cause.message {
                write!(f, ": {msg}")?;
            }
        }
        if let (Some(local), Some(remote)) = (&self.local_address, &self.remote_address) {
            write!(f, " (thrown at {local}, observed from {remote})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteFault {}

/// Truncate a trace at the first dispatch-marker frame. The marker frame
/// and everything below it belong to the dispatch machinery, not the
/// application.
fn prune(trace: &mut Vec<FaultFrame>) {
    if let Some(i) = trace.iter().position(|f| f.file == DISPATCH_MARKER) {
        trace.truncate(i);
    }
}

/// Write an optional fault: `NOT_NULL` tag, both endpoint addresses, then
/// the chain root-first.
pub(crate) fn write_fault<W: Write>(
    out: &mut InvocationOutput<W>,
    fault: Option<&RemoteFault>,
    local_address: &str,
    remote_address: &str,
) -> io::Result<()> {
    let Some(fault) = fault else {
        return out.write_u8(TAG_NULL);
    };

    out.write_u8(TAG_NOT_NULL)?;
    out.write_string(local_address)?;
    out.write_string(remote_address)?;

    let chain_len = u32::try_from(fault.chain.len())
        .map_err(|_| invalid_data("fault chain too long"))?;
    out.write_varuint(chain_len)?;

    let do_prune = prune_traces();
    for entry in &fault.chain {
        out.write_string(&entry.type_name)?;
        out.write_opt_string(entry.message.as_deref())?;

        let mut trace = entry.trace.clone();
        if do_prune {
            prune(&mut trace);
        }
        out.write_varuint(trace.len() as u32)?;
        for frame in &trace {
            out.write_string(&frame.function)?;
            out.write_string(&frame.file)?;
            out.write_varuint(frame.line)?;
        }
    }
    Ok(())
}

/// Read an optional fault written by [`write_fault`].
pub(crate) fn read_fault<R: Read>(
    inp: &mut InvocationInput<R>,
) -> io::Result<Option<RemoteFault>> {
    match inp.read_u8()? {
        TAG_NULL => return Ok(None),
        TAG_NOT_NULL => {}
        other => return Err(invalid_data(format!("invalid fault tag {other}"))),
    }

    let local_address = inp.read_string()?;
    let remote_address = inp.read_string()?;
    let chain_len = inp.read_varuint()?;
    if chain_len == 0 {
        return Err(invalid_data("empty fault chain"));
    }

    let mut chain = Vec::with_capacity(chain_len.min(64) as usize);
    for _ in 0..chain_len {
        let type_name = inp.read_string()?;
        let message = inp.read_opt_string()?;
        let frames = inp.read_varuint()?;
        let mut trace = Vec::with_capacity(frames.min(256) as usize);
        for _ in 0..frames {
            let function = inp.read_string()?;
            let file = inp.read_string()?;
            let line = inp.read_varuint()?;
            trace.push(FaultFrame {
                function,
                file,
                line,
            });
        }
        chain.push(FaultEntry {
            type_name,
            message,
            trace,
        });
    }

    Ok(Some(RemoteFault {
        local_address: Some(local_address),
        remote_address: Some(remote_address),
        chain,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(fault: &RemoteFault) -> RemoteFault {
        let mut out = InvocationOutput::new(Vec::new());
        write_fault(&mut out, Some(fault), "local:1", "remote:2").unwrap();
        let buf = out.get_mut().clone();
        let mut inp = InvocationInput::new(buf.as_slice());
        read_fault(&mut inp).unwrap().unwrap()
    }

    #[test]
    fn chain_round_trips_with_addresses() {
        let fault = RemoteFault::new("storage.Corrupt", "bad page")
            .wrapped("db.ReadFailed", "table scan aborted")
            .wrapped("api.Unavailable", "request failed");

        let got = round_trip(&fault);
        assert_eq!(got.chain_len(), 3);
        assert_eq!(got.head().type_name, "api.Unavailable");
        assert_eq!(got.causes().count(), 2);
        assert_eq!(got.local_address.as_deref(), Some("local:1"));
        assert_eq!(got.remote_address.as_deref(), Some("remote:2"));
        let root = got.causes().last().unwrap();
        assert_eq!(root.type_name, "storage.Corrupt");
        assert_eq!(root.message.as_deref(), Some("bad page"));
    }

    #[test]
    fn trace_is_pruned_at_dispatch_marker() {
        let fault = RemoteFault::new("app.Boom", "exploded")
            .with_frame("app::boom", "app.rs", 10)
            .with_frame("dispatch", DISPATCH_MARKER, 99)
            .with_frame("serve_loop", "session.rs", 120);

        let got = round_trip(&fault);
        let trace = &got.head().trace;
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].file, "app.rs");
        assert!(trace.iter().all(|f| f.file != DISPATCH_MARKER));
    }

    #[test]
    fn null_fault_round_trips() {
        let mut out = InvocationOutput::new(Vec::new());
        write_fault(&mut out, None, "a", "b").unwrap();
        let buf = out.get_mut().clone();
        let mut inp = InvocationInput::new(buf.as_slice());
        assert!(read_fault(&mut inp).unwrap().is_none());
    }

    #[test]
    fn display_shows_head_then_causes() {
        let fault = RemoteFault::new("C", "root").wrapped("B", "mid").wrapped("A", "head");
        let s = fault.to_string();
        assert!(s.starts_with("A: head"));
        assert!(s.contains("caused by B: mid"));
        assert!(s.contains("caused by C: root"));
    }
}
