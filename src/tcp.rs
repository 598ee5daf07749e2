//! Reference TCP transport: one socket per channel.
//!
//! Each side runs a listener and knows the peer's listener address, so both
//! can open channels. Sockets are `TCP_NODELAY`; flushing is explicit at the
//! framing layer, so Nagle buying extra latency helps nothing here.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::stream::{Deframer, Framer};
use crate::transport::{
    ChannelCloser, ChannelControl, ChannelPair, ChannelReader, ChannelWriter, Transport,
};

/// TCP transport between two fixed peers.
pub struct TcpTransport {
    listener: TcpListener,
    peer: SocketAddr,
    local: SocketAddr,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Wrap an existing listener; `peer` is the other side's listener.
    pub fn new(listener: TcpListener, peer: SocketAddr) -> io::Result<Self> {
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            peer,
            local,
            closed: AtomicBool::new(false),
        })
    }

    /// Bind a listener and point it at the peer's listener address.
    pub fn bind(bind: impl ToSocketAddrs, peer: SocketAddr) -> io::Result<Self> {
        Self::new(TcpListener::bind(bind)?, peer)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn channel_from(stream: TcpStream) -> io::Result<ChannelPair> {
        stream.set_nodelay(true)?;
        let local_address = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let remote_address = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());

        let reader_stream = stream.try_clone()?;
        let control_stream = stream.try_clone()?;

        Ok(ChannelPair {
            reader: Box::new(TcpReader {
                stream: reader_stream,
                deframer: Deframer::new(),
            }),
            writer: Box::new(TcpWriter {
                stream,
                framer: Framer::new(),
            }),
            closer: ChannelCloser::new(Arc::new(TcpControl {
                stream: control_stream,
                closed: AtomicBool::new(false),
            })),
            local_address,
            remote_address,
        })
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> io::Result<ChannelPair> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        Self::channel_from(TcpStream::connect(self.peer)?)
    }

    fn accept(&self) -> io::Result<ChannelPair> {
        let (stream, _) = self.listener.accept()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transport closed",
            ));
        }
        Self::channel_from(stream)
    }

    fn local_address(&self) -> String {
        self.local.to_string()
    }

    fn remote_address(&self) -> String {
        self.peer.to_string()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Wake a blocked accept with a throwaway connection.
            let _ = TcpStream::connect(self.local);
        }
    }
}

struct TcpReader {
    stream: TcpStream,
    deframer: Deframer,
}

impl Read for TcpReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.deframer.read_from(&mut self.stream, buf)
    }
}

impl ChannelReader for TcpReader {
    fn is_ready(&mut self) -> io::Result<bool> {
        if self.deframer.mid_packet() || self.deframer.is_suspended() {
            return Ok(true);
        }
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let result = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false)?;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn wait_ready(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if self.deframer.mid_packet() || self.deframer.is_suspended() {
            return Ok(true);
        }
        let mut probe = [0u8; 1];
        match timeout {
            None => {
                self.stream.peek(&mut probe)?;
                Ok(true)
            }
            Some(timeout) => {
                self.stream.set_read_timeout(Some(timeout))?;
                let result = self.stream.peek(&mut probe);
                self.stream.set_read_timeout(None)?;
                match result {
                    Ok(_) => Ok(true),
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn input_resume(&mut self) -> bool {
        self.deframer.resume()
    }
}

struct TcpWriter {
    stream: TcpStream,
    framer: Framer,
}

impl Write for TcpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.framer.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.framer.flush_to(&mut self.stream)
    }
}

impl ChannelWriter for TcpWriter {
    fn output_suspend(&mut self) -> io::Result<()> {
        self.framer.suspend_to(&mut self.stream)
    }
}

impl Drop for TcpWriter {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

struct TcpControl {
    stream: TcpStream,
    closed: AtomicBool,
}

impl ChannelControl for TcpControl {
    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_pair() -> (TcpTransport, TcpTransport) {
        let la = TcpListener::bind("127.0.0.1:0").unwrap();
        let lb = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr_a = la.local_addr().unwrap();
        let addr_b = lb.local_addr().unwrap();
        (
            TcpTransport::new(la, addr_b).unwrap(),
            TcpTransport::new(lb, addr_a).unwrap(),
        )
    }

    #[test]
    fn bytes_round_trip_over_sockets() {
        let (a, b) = transport_pair();
        let accepted = std::thread::spawn(move || {
            let mut pair = b.accept().unwrap();
            let mut buf = [0u8; 5];
            pair.reader.read_exact(&mut buf).unwrap();
            pair.writer.write_all(&buf).unwrap();
            pair.writer.flush().unwrap();
            buf
        });

        let mut pair = a.connect().unwrap();
        pair.writer.write_all(b"hello").unwrap();
        pair.writer.flush().unwrap();
        let mut buf = [0u8; 5];
        pair.reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(&accepted.join().unwrap(), b"hello");
    }

    #[test]
    fn wait_ready_times_out_on_silence() {
        let (a, b) = transport_pair();
        let accepted = std::thread::spawn(move || b.accept().unwrap());
        let mut pair = a.connect().unwrap();
        let _accepted = accepted.join().unwrap();

        let ready = pair
            .reader
            .wait_ready(Some(Duration::from_millis(50)))
            .unwrap();
        assert!(!ready);
    }
}
