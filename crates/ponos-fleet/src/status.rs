//! Bounded, single-consumer status stream of a performer.
//!
//! Emission never blocks: when the buffer is full the newest event is
//! dropped. The stream is closed exactly once, when the performer is
//! removed or retired; the consumer then sees `None`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use ponos_core::StatusEvent;

pub type StatusStream = mpsc::Receiver<StatusEvent>;

/// Producer side of a status stream.
pub struct StatusSender {
    tx: Mutex<Option<mpsc::Sender<StatusEvent>>>,
    dropped: AtomicU64,
}

pub fn status_channel(capacity: usize) -> (StatusSender, StatusStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = StatusSender {
        tx: Mutex::new(Some(tx)),
        dropped: AtomicU64::new(0),
    };
    (sender, rx)
}

impl StatusSender {
    /// Try to deliver an event. Returns `false` if it was dropped.
    pub fn emit(&self, event: StatusEvent) -> bool {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(performer_id = %event.performer_id, kind = ?event.kind, "status stream full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Close the stream. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Events lost to a full buffer so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
