/*!
 * Progress event publisher for transfer monitoring
 *
 * Events are published over a crossbeam channel; the orchestrator never
 * blocks on a slow or absent subscriber.
 */

use crate::transfer::TransferKind;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Progress event types
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Transfer started (after planning and resume reconciliation)
    TransferStarted {
        kind: TransferKind,
        source: String,
        destination: String,
        total_bytes: u64,
        total_parts: usize,
        resumed_parts: usize,
        timestamp: u64,
    },

    /// A part finished successfully
    PartCompleted {
        part_number: u32,
        part_bytes: u64,
        consumed_bytes: u64,
        total_bytes: u64,
        timestamp: u64,
    },

    /// A part failed after all retries
    PartFailed {
        part_number: u32,
        error: String,
        timestamp: u64,
    },

    /// Finalize succeeded
    TransferCompleted {
        total_bytes: u64,
        duration_ms: u64,
        crc64: Option<u64>,
        timestamp: u64,
    },

    /// Transfer failed; the checkpoint (if any) stays on disk
    TransferFailed {
        error: String,
        consumed_bytes: u64,
        timestamp: u64,
    },
}

impl ProgressEvent {
    pub(crate) fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Publisher handle; cheap to clone, a no-op when nobody subscribed
#[derive(Debug, Clone, Default)]
pub struct ProgressPublisher {
    sender: Option<Sender<ProgressEvent>>,
}

impl ProgressPublisher {
    /// Publisher that drops every event
    pub fn noop() -> Self {
        Self { sender: None }
    }

    /// Publisher with an unbounded queue
    pub fn unbounded() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = unbounded();
        (Self { sender: Some(tx) }, rx)
    }

    /// Publisher with a bounded queue; events are dropped when it is full
    pub fn bounded(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { sender: Some(tx) }, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn publish(&self, event: ProgressEvent) {
        if let Some(ref sender) = self.sender {
            match sender.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("Progress queue full, dropping event");
                }
            }
        }
    }
}
