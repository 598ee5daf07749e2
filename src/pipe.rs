//! User-level duplex byte pipe carved out of an invocation channel.
//!
//! A pipe bypasses the value codec: both ends exchange raw bytes with
//! explicit flush. Closing runs the recycle protocol so the underlying
//! channel survives: flush, emit the suspend marker, drain until the peer's
//! marker is observed, resume input. The client side then returns the
//! channel to its pool; the serving side resumes its request loop on it.

use std::io::{self, Read, Write};
use std::sync::Weak;

use tracing::debug;

use crate::channel::InvocationChannel;
use crate::session::SessionInner;

/// One end of a request-reply pipe.
pub struct Pipe {
    chan: Option<InvocationChannel>,
    session: Weak<SessionInner>,
    server_side: bool,
    closed: bool,
}

impl Pipe {
    pub(crate) fn for_client(chan: InvocationChannel, session: Weak<SessionInner>) -> Self {
        Self {
            chan: Some(chan),
            session,
            server_side: false,
            closed: false,
        }
    }

    pub(crate) fn for_server(chan: InvocationChannel) -> Self {
        Self {
            chan: Some(chan),
            session: Weak::new(),
            server_side: true,
            closed: false,
        }
    }

    /// Finish this end: flush, suspend output, drain the peer's remaining
    /// bytes, resume input. Blocks until the peer finishes its side.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Some(chan) = self.chan.as_mut() else {
            return Ok(());
        };

        let recycle = (|| -> io::Result<bool> {
            chan.out.flush()?;
            chan.out.get_mut().output_suspend()?;

            let mut scratch = [0u8; 512];
            while chan.inp.get_mut().read(&mut scratch)? != 0 {}
            Ok(chan.inp.get_mut().input_resume())
        })();

        match recycle {
            Ok(true) => Ok(()),
            Ok(false) => {
                // The peer ended the stream instead of suspending; the
                // channel cannot be recycled.
                debug!("pipe peer closed without suspend marker");
                if let Some(chan) = self.chan.take() {
                    chan.disconnect();
                }
                Ok(())
            }
            Err(e) => {
                if let Some(chan) = self.chan.take() {
                    chan.disconnect();
                }
                Err(e)
            }
        }
    }

    /// Serving side: run the recycle protocol and hand the channel back for
    /// further requests. `None` when the channel did not survive.
    pub(crate) fn finish_server(mut self) -> Option<InvocationChannel> {
        debug_assert!(self.server_side);
        let _ = self.close();
        self.chan.take()
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.chan.as_mut() {
            Some(chan) => chan.inp.get_mut().read(buf),
            None => Ok(0),
        }
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.chan.as_mut() {
            Some(chan) => chan.out.get_mut().write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.chan.as_mut() {
            Some(chan) => chan.out.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
        if self.server_side {
            return;
        }
        // Client side: a recycled channel rejoins the pool.
        if let Some(chan) = self.chan.take() {
            if let Some(session) = self.session.upgrade() {
                session.release_channel(chan, true);
            } else {
                chan.disconnect();
            }
        }
    }
}
