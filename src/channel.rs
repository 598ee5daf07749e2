//! Invocation channels: typed codec state bound to one transport channel.
//!
//! A channel's lifecycle is expressed through ownership. The pool owns idle
//! channels; a calling thread owns a lent channel for the duration of one
//! call; a batched channel is pinned in thread-local storage until the batch
//! resolves; a suspended channel is owned by a user pipe; a closed channel
//! is dropped. The output side carries the shared-string intern table whose
//! reset keeps stale back-references from leaking between calls on a reused
//! channel.

use std::io::{self, Read};

use crate::ident::VersionedId;
use crate::transport::{ChannelCloser, ChannelPair, ChannelReader, ChannelWriter};
use crate::value::{read_value, write_value, MarshalHooks, Value};
use crate::wire::{invalid_data, InvocationInput, InvocationOutput};

/// Request mode: plain call, expecting dispatch now.
pub(crate) const MODE_CALL: u8 = 0;
/// Request mode: buffered on the channel until the batch resolves.
pub(crate) const MODE_BATCHED: u8 = 1;
/// Request mode: resolve the pending batch without a closing call.
pub(crate) const MODE_FLUSH: u8 = 2;

/// Response status: normal return, payload follows.
pub(crate) const STATUS_OK: u8 = 0;
/// Response status: transported fault follows.
pub(crate) const STATUS_FAULT: u8 = 1;
/// Response status: batch applied cleanly, no payload.
pub(crate) const STATUS_BATCH_ACK: u8 = 2;

/// A request header as observed by the serving side.
pub(crate) enum Request {
    Call {
        batched: bool,
        obj: VersionedId,
        selector: u32,
    },
    Flush,
}

/// One duplex invocation channel owned by the session.
pub(crate) struct InvocationChannel {
    pub out: InvocationOutput<Box<dyn ChannelWriter>>,
    pub inp: InvocationInput<Box<dyn ChannelReader>>,
    pub closer: ChannelCloser,
    pub local_address: String,
    pub remote_address: String,
}

impl InvocationChannel {
    pub fn from_pair(pair: ChannelPair) -> Self {
        Self {
            out: InvocationOutput::new(pair.writer),
            inp: InvocationInput::new(pair.reader),
            closer: pair.closer,
            local_address: pair.local_address,
            remote_address: pair.remote_address,
        }
    }

    pub fn write_value(&mut self, value: &Value, hooks: &dyn MarshalHooks) -> io::Result<()> {
        write_value(&mut self.out, value, hooks)
    }

    pub fn read_value(&mut self, hooks: &dyn MarshalHooks) -> io::Result<Value> {
        read_value(&mut self.inp, hooks)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn write_request(&mut self, mode: u8, obj: VersionedId, selector: u32) -> io::Result<()> {
        self.out.write_u8(mode)?;
        obj.write_to(&mut self.out)?;
        self.out.write_varuint(selector)
    }

    pub fn write_flush_request(&mut self) -> io::Result<()> {
        self.out.write_u8(MODE_FLUSH)
    }

    /// Read the next request header; `None` at a clean end of channel.
    pub fn read_request(&mut self) -> io::Result<Option<Request>> {
        let mut first = [0u8; 1];
        if self.inp.get_mut().read(&mut first)? == 0 {
            return Ok(None);
        }
        match first[0] {
            MODE_FLUSH => Ok(Some(Request::Flush)),
            mode @ (MODE_CALL | MODE_BATCHED) => {
                let obj = VersionedId::read_from(&mut self.inp)?;
                let selector = self.inp.read_varuint()?;
                Ok(Some(Request::Call {
                    batched: mode == MODE_BATCHED,
                    obj,
                    selector,
                }))
            }
            other => Err(invalid_data(format!("invalid request mode {other}"))),
        }
    }

    pub fn disconnect(&self) {
        self.closer.disconnect();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}
