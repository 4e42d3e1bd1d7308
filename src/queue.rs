//! Bounded output queue.
//!
//! Extent records are posted onto a many-writer single-reader queue with
//! a per-call timeout; a full queue exerts backpressure on the beam
//! tasks. An empty payload is the end-of-stream terminator.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

/// Timeout applied to each individual post.
pub const SYS_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a post.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PostStatus {
    Ok,
    /// The queue stayed full for the whole timeout; the caller may retry.
    Timeout,
    /// The reader is gone; no further posts can succeed.
    Error,
}

/// Writer half of the output queue.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Bytes>,
}

impl Publisher {
    /// Create a queue of the given depth, returning the shared writer and
    /// the single reader.
    pub fn channel(depth: usize) -> (Publisher, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth);
        (Publisher { tx }, rx)
    }

    /// Post one frame, waiting at most `timeout` for queue space.
    pub async fn post(&self, data: Bytes, timeout: Duration) -> PostStatus {
        match self.tx.send_timeout(data, timeout).await {
            Ok(()) => PostStatus::Ok,
            Err(SendTimeoutError::Timeout(_)) => PostStatus::Timeout,
            Err(SendTimeoutError::Closed(_)) => PostStatus::Error,
        }
    }

    /// Post the end-of-stream terminator.
    pub async fn post_terminator(&self, timeout: Duration) -> PostStatus {
        self.post(Bytes::new(), timeout).await
    }
}
