//! Pool of idle invocation channels between two peers.
//!
//! Channels are lent to threads for the duration of a call and returned for
//! reuse. The pool also tracks every live channel's control handle so a
//! closing session can break in-flight calls promptly. The monitor is never
//! held across channel I/O or transport connects.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::InvocationChannel;
use crate::transport::{ChannelPair, Transport};

pub(crate) struct ChannelPool {
    transport: Arc<dyn Transport>,
    /// Idle channels, most recently used last.
    idle: Mutex<Vec<InvocationChannel>>,
    /// Soft cap on retained idle channels; extras are closed on release.
    cap: usize,
    /// Control handles of every channel minted through this pool.
    group: Mutex<Vec<crate::transport::ChannelCloser>>,
}

impl ChannelPool {
    pub fn new(transport: Arc<dyn Transport>, cap: usize) -> Self {
        Self {
            transport,
            idle: Mutex::new(Vec::new()),
            cap,
            group: Mutex::new(Vec::new()),
        }
    }

    /// Lend an idle channel, or open a new one via the transport.
    pub fn acquire(&self) -> io::Result<InvocationChannel> {
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(chan) if chan.is_closed() => continue,
                Some(chan) => return Ok(chan),
                None => break,
            }
        }
        let pair = self.transport.connect()?;
        Ok(self.adopt(pair))
    }

    /// Wrap and track a channel pair, whichever side opened it.
    pub fn adopt(&self, pair: ChannelPair) -> InvocationChannel {
        let chan = InvocationChannel::from_pair(pair);
        let mut group = self.group.lock();
        group.retain(|closer| !closer.is_closed());
        group.push(chan.closer.clone());
        chan
    }

    /// Return a channel for reuse. `reset` clears the output intern table so
    /// no back-references leak into the next borrower's calls.
    pub fn release(&self, mut chan: InvocationChannel, reset: bool) {
        if chan.is_closed() {
            return;
        }
        if reset {
            chan.out.reset();
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.cap {
            idle.push(chan);
        } else {
            drop(idle);
            debug!("channel pool at capacity; closing released channel");
            chan.disconnect();
        }
    }

    /// Close a channel that failed mid-call.
    pub fn discard(&self, chan: InvocationChannel) {
        chan.disconnect();
    }

    /// Break every channel minted through this pool, idle or lent.
    pub fn disconnect_all(&self) {
        for chan in self.idle.lock().drain(..) {
            chan.disconnect();
        }
        for closer in self.group.lock().drain(..) {
            closer.disconnect();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem;
    use crate::transport::Transport;

    fn pool_with_acceptor() -> (ChannelPool, std::thread::JoinHandle<usize>) {
        let (a, b) = mem::pair();
        let acceptor = std::thread::spawn(move || {
            let mut accepted = 0;
            while b.accept().is_ok() {
                accepted += 1;
            }
            accepted
        });
        (ChannelPool::new(Arc::new(a), 2), acceptor)
    }

    #[test]
    fn released_channel_is_reused() {
        let (pool, _acceptor) = pool_with_acceptor();
        let chan = pool.acquire().unwrap();
        let addr = chan.local_address.clone();
        pool.release(chan, false);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.acquire().unwrap();
        assert_eq!(again.local_address, addr);
        assert_eq!(pool.idle_count(), 0);
        pool.disconnect_all();
    }

    #[test]
    fn release_beyond_cap_closes_channel() {
        let (pool, _acceptor) = pool_with_acceptor();
        let c1 = pool.acquire().unwrap();
        let c2 = pool.acquire().unwrap();
        let c3 = pool.acquire().unwrap();
        pool.release(c1, false);
        pool.release(c2, false);
        pool.release(c3, false);
        assert_eq!(pool.idle_count(), 2);
        pool.disconnect_all();
    }

    #[test]
    fn closed_idle_channels_are_skipped() {
        let (pool, _acceptor) = pool_with_acceptor();
        let chan = pool.acquire().unwrap();
        let closer = chan.closer.clone();
        pool.release(chan, false);
        closer.disconnect();

        let fresh = pool.acquire().unwrap();
        assert!(!fresh.is_closed());
        pool.disconnect_all();
    }

    #[test]
    fn disconnect_all_breaks_lent_channels() {
        let (pool, _acceptor) = pool_with_acceptor();
        let lent = pool.acquire().unwrap();
        pool.disconnect_all();
        assert!(lent.is_closed());
    }
}
