//! Byte-stream transport
//!
//! The session keeps the read half; writes go through a [`Connection`]
//! whose background task owns the write half. `write` never blocks: it
//! reports whether the buffered total is still under the high-water mark,
//! and the writer task emits [`WriterEvent::Drained`] once a refused
//! backlog has been flushed.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Any duplex byte stream a session can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Notifications from the writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    /// The backlog that caused a refused write has been flushed
    Drained,
    /// Writing failed; the connection is gone
    Failed(String),
}

/// Write side of a connection
#[derive(Debug)]
pub struct Connection {
    sender: mpsc::UnboundedSender<Bytes>,
    pending: Arc<AtomicUsize>,
    blocked: Arc<AtomicBool>,
    high_water: usize,
}

impl Connection {
    /// Spawn the writer task over `writer`
    pub fn spawn<W>(
        mut writer: W,
        high_water: usize,
        events: mpsc::UnboundedSender<WriterEvent>,
    ) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (conn, mut rx) = Self::channel(high_water);
        let pending = conn.pending.clone();
        let blocked = conn.blocked.clone();

        let task = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    let _ = events.send(WriterEvent::Failed(e.to_string()));
                    return;
                }

                let left = pending.fetch_sub(data.len(), Ordering::AcqRel) - data.len();
                if left == 0 {
                    if let Err(e) = writer.flush().await {
                        let _ = events.send(WriterEvent::Failed(e.to_string()));
                        return;
                    }
                    if blocked.swap(false, Ordering::AcqRel) {
                        let _ = events.send(WriterEvent::Drained);
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        (conn, task)
    }

    /// A connection whose frames land in a channel instead of a socket
    pub fn channel(high_water: usize) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let conn = Self {
            sender,
            pending: Arc::new(AtomicUsize::new(0)),
            blocked: Arc::new(AtomicBool::new(false)),
            high_water,
        };
        (conn, rx)
    }

    /// Queue `data`. Returns false if the caller should wait for a drain.
    pub fn write(&self, data: Bytes) -> bool {
        let len = data.len();
        let total = self.pending.fetch_add(len, Ordering::AcqRel) + len;
        // Set before the frame is visible to the writer
        let refused = total > self.high_water;
        if refused {
            self.blocked.store(true, Ordering::Release);
        }
        if self.sender.send(data).is_err() {
            self.pending.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        !refused
    }

    /// Bytes queued but not yet written
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
