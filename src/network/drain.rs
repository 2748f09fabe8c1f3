//! Write backpressure
//!
//! When the transport refuses a write the frame stays buffered and its size
//! is counted here. Callers can wait for the buffer to empty; a peer that
//! lets too much pile up is considered stalled.

use crate::network::error::PeerError;
use tokio::sync::oneshot;

/// Default buffered-bytes limit before the peer is dropped
pub const DEFAULT_MAX_DRAIN: usize = 10 << 20;

/// Buffered-byte counter with drain waiters
#[derive(Debug)]
pub struct DrainQueue {
    size: usize,
    max: usize,
    waiters: Vec<oneshot::Sender<Result<(), PeerError>>>,
}

impl DrainQueue {
    pub fn new(max: usize) -> Self {
        Self {
            size: 0,
            max,
            waiters: Vec::new(),
        }
    }

    /// Bytes written but not yet flushed
    pub fn size(&self) -> usize {
        self.size
    }

    /// Account for a refused write
    pub fn needs_drain(&mut self, len: usize) -> Result<(), PeerError> {
        self.size += len;
        if self.size >= self.max {
            return Err(PeerError::DrainStalled(self.size));
        }
        Ok(())
    }

    /// The transport flushed everything
    pub fn drained(&mut self) {
        self.size = 0;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Wait for the next drain. `None` when nothing is buffered.
    pub fn wait(&mut self) -> Option<oneshot::Receiver<Result<(), PeerError>>> {
        if self.size == 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        Some(rx)
    }

    pub fn reject_all(&mut self, err: &PeerError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}

impl Default for DrainQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DRAIN)
    }
}
