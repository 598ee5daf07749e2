//! Packet framing over a raw duplex byte stream.
//!
//! Output is buffered and emitted as `varuint(len)`-prefixed packets on
//! flush. A zero-length packet is the reserved suspend marker: the reader
//! reports EOF from that point until input is resumed, which is how a
//! channel is handed over as a user pipe and later recycled back into the
//! pool without tearing down the underlying stream.

use std::io::{self, Read, Write};

use crate::wire::write_varuint_to;

/// Largest data packet emitted; longer flushes split into several packets.
const MAX_PACKET: usize = 32 * 1024;

/// Buffering, packet-emitting write half.
pub(crate) struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        self.buf.extend_from_slice(data);
        data.len()
    }

    /// Emit buffered bytes as packets and flush the underlying stream.
    pub fn flush_to<W: Write + ?Sized>(&mut self, w: &mut W) -> io::Result<()> {
        for chunk in self.buf.chunks(MAX_PACKET) {
            write_varuint_to(w, chunk.len() as u32)?;
            w.write_all(chunk)?;
        }
        self.buf.clear();
        w.flush()
    }

    /// Flush, then emit the suspend marker.
    pub fn suspend_to<W: Write + ?Sized>(&mut self, w: &mut W) -> io::Result<()> {
        self.flush_to(w)?;
        write_varuint_to(w, 0)?;
        w.flush()
    }
}

/// Packet-splitting read half.
pub(crate) struct Deframer {
    /// Bytes left in the packet currently being consumed.
    remaining: usize,
    suspended: bool,
}

impl Deframer {
    pub fn new() -> Self {
        Self {
            remaining: 0,
            suspended: false,
        }
    }

    /// True when packet bytes are already in flight, so a read would not
    /// block on the header.
    pub fn mid_packet(&self) -> bool {
        self.remaining > 0
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Clear a pending suspend marker. Returns false when none is pending.
    pub fn resume(&mut self) -> bool {
        if self.suspended {
            self.suspended = false;
            true
        } else {
            false
        }
    }

    /// Read up to `buf.len()` payload bytes. Returns zero at a suspend
    /// marker (until resumed) and at end of stream.
    pub fn read_from<R: Read + ?Sized>(&mut self, r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if self.suspended || buf.is_empty() {
            return Ok(0);
        }

        while self.remaining == 0 {
            match self.read_header(r)? {
                None => return Ok(0),
                Some(0) => {
                    self.suspended = true;
                    return Ok(0);
                }
                Some(len) => self.remaining = len,
            }
        }

        let want = self.remaining.min(buf.len());
        let n = r.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a packet",
            ));
        }
        self.remaining -= n;
        Ok(n)
    }

    /// Read one packet header. `None` is a clean end of stream.
    fn read_header<R: Read + ?Sized>(&mut self, r: &mut R) -> io::Result<Option<usize>> {
        let mut first = [0u8; 1];
        if r.read(&mut first)? == 0 {
            return Ok(None);
        }
        let b0 = first[0];

        let extra = if b0 < 0x80 {
            0
        } else if b0 < 0xc0 {
            1
        } else if b0 < 0xe0 {
            2
        } else if b0 < 0xf0 {
            3
        } else {
            4
        };

        let mut rest = [0u8; 4];
        r.read_exact(&mut rest[..extra])?;

        let len = match extra {
            0 => b0 as u32,
            1 => ((b0 as u32 & 0x3f) << 8) | rest[0] as u32,
            2 => ((b0 as u32 & 0x1f) << 16) | (rest[0] as u32) << 8 | rest[1] as u32,
            3 => {
                ((b0 as u32 & 0x0f) << 24)
                    | (rest[0] as u32) << 16
                    | (rest[1] as u32) << 8
                    | rest[2] as u32
            }
            _ => u32::from_be_bytes(rest),
        };
        Ok(Some(len as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(deframer: &mut Deframer, data: &[u8], chunk: usize) -> Vec<u8> {
        let mut cursor = Cursor::new(data.to_vec());
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = deframer.read_from(&mut cursor, &mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn packets_round_trip() {
        let mut framer = Framer::new();
        let mut wire = Vec::new();
        framer.write(b"hello ");
        framer.write(b"world");
        framer.flush_to(&mut wire).unwrap();

        let mut deframer = Deframer::new();
        assert_eq!(read_all(&mut deframer, &wire, 4), b"hello world");
    }

    #[test]
    fn large_payload_splits_into_packets() {
        let payload = vec![7u8; MAX_PACKET * 2 + 17];
        let mut framer = Framer::new();
        let mut wire = Vec::new();
        framer.write(&payload);
        framer.flush_to(&mut wire).unwrap();

        let mut deframer = Deframer::new();
        assert_eq!(read_all(&mut deframer, &wire, 1000), payload);
    }

    #[test]
    fn suspend_marker_reads_as_eof_until_resumed() {
        let mut framer = Framer::new();
        let mut wire = Vec::new();
        framer.write(b"before");
        framer.suspend_to(&mut wire).unwrap();
        framer.write(b"after");
        framer.flush_to(&mut wire).unwrap();

        let mut cursor = Cursor::new(wire);
        let mut deframer = Deframer::new();
        let mut buf = [0u8; 16];

        let n = deframer.read_from(&mut cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"before");

        // The marker reads as a stubborn EOF.
        assert_eq!(deframer.read_from(&mut cursor, &mut buf).unwrap(), 0);
        assert_eq!(deframer.read_from(&mut cursor, &mut buf).unwrap(), 0);
        assert!(deframer.is_suspended());

        assert!(deframer.resume());
        assert!(!deframer.resume());
        let n = deframer.read_from(&mut cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"after");
    }

    #[test]
    fn clean_stream_end_reads_zero() {
        let mut deframer = Deframer::new();
        let mut buf = [0u8; 8];
        let mut cursor = Cursor::new(Vec::new());
        assert_eq!(deframer.read_from(&mut cursor, &mut buf).unwrap(), 0);
    }
}
