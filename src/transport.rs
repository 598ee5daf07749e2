//! Transport abstraction consumed by the session layer.
//!
//! A transport mints duplex byte channels between two fixed peers: `connect`
//! opens a channel, `accept` receives one the peer opened. The session
//! treats channels as opaque in-order byte streams with explicit flush,
//! half-close via a suspend marker, and a readiness check. Address strings
//! are opaque too; the core only stamps them into transported faults.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Read side of a channel.
pub trait ChannelReader: Read + Send {
    /// True when a read would return without blocking.
    fn is_ready(&mut self) -> io::Result<bool>;

    /// Block until a read would succeed, the channel ends, or the timeout
    /// elapses. Returns false only on timeout.
    fn wait_ready(&mut self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Resume input after a suspend marker has been observed as EOF.
    /// Returns false when no suspend marker is pending.
    fn input_resume(&mut self) -> bool;
}

/// Write side of a channel. Writes are buffered; `flush` makes them visible
/// to the peer.
pub trait ChannelWriter: Write + Send {
    /// Flush buffered output, then emit a suspend marker. The peer's reads
    /// return EOF until it resumes input.
    fn output_suspend(&mut self) -> io::Result<()>;
}

/// Implementation side of [`ChannelCloser`].
pub trait ChannelControl: Send + Sync {
    /// Forcibly close the channel, discarding unflushed output. Safe to
    /// call from any thread; blocked reads and writes fail promptly.
    fn disconnect(&self);

    fn is_closed(&self) -> bool;
}

/// Clonable handle that can close a channel from any thread, which is how
/// timeout tasks interrupt a stuck call.
#[derive(Clone)]
pub struct ChannelCloser {
    inner: Arc<dyn ChannelControl>,
}

impl ChannelCloser {
    pub fn new(inner: Arc<dyn ChannelControl>) -> Self {
        Self { inner }
    }

    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// One duplex channel: split reader and writer plus the control handle.
pub struct ChannelPair {
    pub reader: Box<dyn ChannelReader>,
    pub writer: Box<dyn ChannelWriter>,
    pub closer: ChannelCloser,
    pub local_address: String,
    pub remote_address: String,
}

/// A duplex-channel factory between two fixed peers.
pub trait Transport: Send + Sync + 'static {
    /// Open a new channel to the peer.
    fn connect(&self) -> io::Result<ChannelPair>;

    /// Receive a channel the peer opened. Blocks until one arrives or the
    /// transport is closed.
    fn accept(&self) -> io::Result<ChannelPair>;

    fn local_address(&self) -> String;

    fn remote_address(&self) -> String;

    /// Stop minting channels and unblock pending accepts. Channels already
    /// established are unaffected.
    fn close(&self);
}
