//! Buffered reader/writer pairs over one socket.
//!
//! The reader yields whole lines with a hard length cap. The writer is the
//! interesting half: it buffers outbound bytes through an unbounded channel
//! but enforces two bounds, and a connection that trips either is abandoned:
//!
//! - **space bound**: more than `connection_buffer` bytes queued and
//!   unwritten means the peer has stopped reading; the writer is abandoned
//!   as if the pipe broke.
//! - **time bound**: a single write blocked longer than
//!   `connection_timeout` means the peer is stuck; the connection is
//!   declared dead with a timeout.
//!
//! The reader and writer halves are the two sides of one split stream; the
//! socket itself closes only when both halves have been dropped.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, trace};

/// Longest accepted protocol line, command or body.
pub const MAX_LINE: usize = 65536;

/// Object-safe bidirectional stream; TCP and Unix sockets both qualify.
pub trait Transport: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Transport for T {}

pub type BoxedStream = Box<dyn Transport>;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line too long (limit {MAX_LINE} bytes)")]
    TooLong,
}

/// Line-at-a-time reader over the read half.
pub struct LineReader {
    frames: FramedRead<ReadHalf<BoxedStream>, LinesCodec>,
}

impl LineReader {
    pub fn new(half: ReadHalf<BoxedStream>) -> Self {
        LineReader {
            frames: FramedRead::new(half, LinesCodec::new_with_max_length(MAX_LINE)),
        }
    }

    /// Next complete line without its terminator; `None` on EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>, LineError> {
        match self.frames.next().await {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(LineError::TooLong),
            Some(Err(LinesCodecError::Io(e))) => Err(LineError::Io(e)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriterError {
    #[error("write buffer overflow, abandoning connection")]
    SpaceBound,
    #[error("writer is gone")]
    Closed,
}

/// Cheap cloneable handle feeding one connection's writer task.
#[derive(Clone)]
pub struct ConnWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    queued: Rc<Cell<usize>>,
    dead: Rc<Cell<bool>>,
    space_bound: usize,
}

impl ConnWriter {
    /// Queue one line (terminator appended) for writing.
    pub fn send_line(&self, line: &str) -> Result<(), WriterError> {
        if self.dead.get() {
            return Err(WriterError::Closed);
        }
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if self.queued.get() + buf.len() > self.space_bound {
            // The peer has stopped draining us; treat like a broken pipe.
            self.dead.set(true);
            return Err(WriterError::SpaceBound);
        }
        self.queued.set(self.queued.get() + buf.len());
        trace!(bytes = buf.len(), queued = self.queued.get(), "queueing write");
        self.tx.send(buf).map_err(|_| WriterError::Closed)
    }

    pub fn is_alive(&self) -> bool {
        !self.dead.get()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.get()
    }
}

/// Start the writer task for one connection and hand back its handle.
pub fn spawn_writer(
    half: WriteHalf<BoxedStream>,
    time_bound: Duration,
    space_bound: usize,
) -> ConnWriter {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Rc::new(Cell::new(0));
    let dead = Rc::new(Cell::new(false));
    tokio::task::spawn_local(writer_task(
        rx,
        half,
        time_bound,
        Rc::clone(&queued),
        Rc::clone(&dead),
    ));
    ConnWriter {
        tx,
        queued,
        dead,
        space_bound,
    }
}

async fn writer_task(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut half: WriteHalf<BoxedStream>,
    time_bound: Duration,
    queued: Rc<Cell<usize>>,
    dead: Rc<Cell<bool>>,
) {
    while let Some(buf) = rx.recv().await {
        match timeout(time_bound, half.write_all(&buf)).await {
            Ok(Ok(())) => {
                queued.set(queued.get().saturating_sub(buf.len()));
            }
            Ok(Err(e)) => {
                // A vanished peer is routine; anything else is worth noise.
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    debug!("connection writer: broken pipe");
                } else {
                    error!(error = %e, "connection writer failed");
                }
                dead.set(true);
                break;
            }
            Err(_) => {
                error!(
                    timeout = ?time_bound,
                    "connection writer timed out, peer presumed dead"
                );
                dead.set(true);
                break;
            }
        }
    }
    let _ = half.shutdown().await;
}
