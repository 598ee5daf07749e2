//! In-process transport backed by shared byte queues.
//!
//! Two endpoints created as a pair; `connect` on one side enqueues the far
//! end of a fresh channel onto the other side's accept queue. No
//! serialization boundary is crossed, which makes this the transport of
//! choice for exercising sessions, pools, and reclamation in tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::stream::{Deframer, Framer};
use crate::transport::{
    ChannelCloser, ChannelControl, ChannelPair, ChannelReader, ChannelWriter, Transport,
};

struct PipeBuf {
    data: VecDeque<u8>,
    eof: bool,
    broken: bool,
}

/// One direction of a channel: a byte queue with blocking reads.
struct MemPipe {
    state: Mutex<PipeBuf>,
    cv: Condvar,
}

impl MemPipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeBuf {
                data: VecDeque::new(),
                eof: false,
                broken: false,
            }),
            cv: Condvar::new(),
        })
    }

    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        loop {
            if state.broken {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "channel disconnected",
                ));
            }
            if !state.data.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    match state.data.pop_front() {
                        Some(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            if state.eof {
                return Ok(0);
            }
            self.cv.wait(&mut state);
        }
    }

    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.broken || state.eof {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        state.data.extend(buf);
        self.cv.notify_all();
        Ok(buf.len())
    }

    fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.broken || state.eof || !state.data.is_empty()
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.broken || state.eof || !state.data.is_empty() {
                return true;
            }
            match deadline {
                None => self.cv.wait(&mut state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.cv.wait_for(&mut state, deadline - now);
                }
            }
        }
    }

    fn set_eof(&self) {
        self.state.lock().eof = true;
        self.cv.notify_all();
    }

    fn break_pipe(&self) {
        self.state.lock().broken = true;
        self.cv.notify_all();
    }
}

/// Read/write adapter so the framing layer sees plain streams.
struct PipeIo(Arc<MemPipe>);

impl Read for PipeIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_bytes(buf)
    }
}

impl Write for PipeIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_bytes(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MemReader {
    io: PipeIo,
    deframer: Deframer,
}

impl Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.deframer.read_from(&mut self.io, buf)
    }
}

impl ChannelReader for MemReader {
    fn is_ready(&mut self) -> io::Result<bool> {
        Ok(self.deframer.mid_packet() || self.deframer.is_suspended() || self.io.0.is_ready())
    }

    fn wait_ready(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if self.deframer.mid_packet() || self.deframer.is_suspended() {
            return Ok(true);
        }
        Ok(self.io.0.wait_ready(timeout))
    }

    fn input_resume(&mut self) -> bool {
        self.deframer.resume()
    }
}

struct MemWriter {
    io: PipeIo,
    framer: Framer,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.framer.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.framer.flush_to(&mut self.io)
    }
}

impl ChannelWriter for MemWriter {
    fn output_suspend(&mut self) -> io::Result<()> {
        self.framer.suspend_to(&mut self.io)
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        // Half-close: the peer reads EOF once buffered data drains.
        self.io.0.set_eof();
    }
}

struct MemControl {
    forward: Arc<MemPipe>,
    back: Arc<MemPipe>,
    closed: AtomicBool,
}

impl ChannelControl for MemControl {
    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.forward.break_pipe();
        self.back.break_pipe();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct AcceptQueue {
    q: Mutex<VecDeque<ChannelPair>>,
    cv: Condvar,
}

struct Hub {
    queues: [AcceptQueue; 2],
    closed: AtomicBool,
    chan_seq: AtomicU64,
}

/// One endpoint of an in-memory transport pair.
pub struct MemTransport {
    hub: Arc<Hub>,
    side: usize,
}

/// Create a connected pair of in-memory transports.
pub fn pair() -> (MemTransport, MemTransport) {
    let hub = Arc::new(Hub {
        queues: [
            AcceptQueue {
                q: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
            },
            AcceptQueue {
                q: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
            },
        ],
        closed: AtomicBool::new(false),
        chan_seq: AtomicU64::new(1),
    });
    (
        MemTransport {
            hub: hub.clone(),
            side: 0,
        },
        MemTransport { hub, side: 1 },
    )
}

impl MemTransport {
    fn make_channel(&self) -> (ChannelPair, ChannelPair) {
        let seq = self.hub.chan_seq.fetch_add(1, Ordering::Relaxed);
        let forward = MemPipe::new();
        let back = MemPipe::new();

        let local_addr = format!("mem:{}:{}", self.side, seq);
        let remote_addr = format!("mem:{}:{}", 1 - self.side, seq);

        let control = |forward: &Arc<MemPipe>, back: &Arc<MemPipe>| {
            ChannelCloser::new(Arc::new(MemControl {
                forward: forward.clone(),
                back: back.clone(),
                closed: AtomicBool::new(false),
            }))
        };

        let local = ChannelPair {
            reader: Box::new(MemReader {
                io: PipeIo(back.clone()),
                deframer: Deframer::new(),
            }),
            writer: Box::new(MemWriter {
                io: PipeIo(forward.clone()),
                framer: Framer::new(),
            }),
            closer: control(&forward, &back),
            local_address: local_addr.clone(),
            remote_address: remote_addr.clone(),
        };
        let remote = ChannelPair {
            reader: Box::new(MemReader {
                io: PipeIo(forward.clone()),
                deframer: Deframer::new(),
            }),
            writer: Box::new(MemWriter {
                io: PipeIo(back.clone()),
                framer: Framer::new(),
            }),
            closer: control(&forward, &back),
            local_address: remote_addr,
            remote_address: local_addr,
        };
        (local, remote)
    }
}

impl Transport for MemTransport {
    fn connect(&self) -> io::Result<ChannelPair> {
        if self.hub.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        let (local, remote) = self.make_channel();
        let peer = &self.hub.queues[1 - self.side];
        peer.q.lock().push_back(remote);
        peer.cv.notify_one();
        Ok(local)
    }

    fn accept(&self) -> io::Result<ChannelPair> {
        let queue = &self.hub.queues[self.side];
        let mut q = queue.q.lock();
        loop {
            if let Some(pair) = q.pop_front() {
                return Ok(pair);
            }
            if self.hub.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "transport closed",
                ));
            }
            queue.cv.wait(&mut q);
        }
    }

    fn local_address(&self) -> String {
        format!("mem:{}", self.side)
    }

    fn remote_address(&self) -> String {
        format!("mem:{}", 1 - self.side)
    }

    fn close(&self) {
        self.hub.closed.store(true, Ordering::SeqCst);
        for queue in &self.hub.queues {
            queue.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_delivers_to_peer_accept() {
        let (a, b) = pair();
        let mut opened = a.connect().unwrap();
        let handle = std::thread::spawn(move || b.accept().unwrap());
        let mut accepted = handle.join().unwrap();

        opened.writer.write_all(b"ping").unwrap();
        opened.writer.flush().unwrap();
        let mut buf = [0u8; 4];
        accepted.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        accepted.writer.write_all(b"pong").unwrap();
        accepted.writer.flush().unwrap();
        opened.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn unflushed_output_is_invisible() {
        let (a, b) = pair();
        let mut opened = a.connect().unwrap();
        let mut accepted = b.accept().unwrap();

        opened.writer.write_all(b"x").unwrap();
        assert!(!accepted.reader.is_ready().unwrap());
        opened.writer.flush().unwrap();
        assert!(accepted.reader.wait_ready(Some(Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn suspend_and_resume_cross_the_transport() {
        let (a, b) = pair();
        let mut opened = a.connect().unwrap();
        let mut accepted = b.accept().unwrap();

        opened.writer.write_all(b"one").unwrap();
        opened.writer.output_suspend().unwrap();
        opened.writer.write_all(b"two").unwrap();
        opened.writer.flush().unwrap();

        let mut buf = [0u8; 8];
        let n = accepted.reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        assert_eq!(accepted.reader.read(&mut buf).unwrap(), 0);
        assert!(accepted.reader.input_resume());
        let n = accepted.reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[test]
    fn disconnect_breaks_blocked_reads() {
        let (a, b) = pair();
        let opened = a.connect().unwrap();
        let mut accepted = b.accept().unwrap();

        let closer = opened.closer.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            closer.disconnect();
        });

        let mut buf = [0u8; 4];
        let err = accepted.reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(opened.closer.is_closed());
    }

    #[test]
    fn close_unblocks_accept() {
        let (a, b) = pair();
        let handle = std::thread::spawn(move || b.accept());
        std::thread::sleep(Duration::from_millis(30));
        a.close();
        // a's close marks the hub closed, which unblocks b's accept.
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn dropped_writer_reads_as_clean_eof() {
        let (a, b) = pair();
        let opened = a.connect().unwrap();
        let mut accepted = b.accept().unwrap();

        drop(opened);
        let mut buf = [0u8; 4];
        assert_eq!(accepted.reader.read(&mut buf).unwrap(), 0);
    }
}
