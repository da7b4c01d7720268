/*!
 * Transfer orchestration: upload, download and server-side copy
 *
 * Every transfer runs the same lifecycle:
 *
 * 1. **Planning**: inspect the source and split it into parts
 * 2. **ResumingOrFresh**: reconcile a stored checkpoint with the current
 *    source, or open a new session
 * 3. **InProgress**: run pending parts on the worker pool, checkpointing
 *    after every result
 * 4. **Finalizing**: re-validate, commit the session (or rename the staged
 *    file) and verify the end-to-end CRC-64
 *
 * The checkpoint is removed on success and kept on any resumable failure.
 */

mod copy;
mod download;
mod upload;

pub use download::staging_path;

use crate::config::TransferConfig;
use crate::core::bandwidth::BandwidthLimiter;
use crate::core::checkpoint::{Checkpoint, PartReceipt};
use crate::core::checksum::ChecksumAccumulator;
use crate::core::chunker::Part;
use crate::core::progress::{ProgressEvent, ProgressPublisher};
use crate::core::scheduler::{self, CancellationToken, PartExecutor, PartOutcome, RunSummary};
use crate::error::{Result, TransferError};
use crate::protocol::{CompletedPart, ObjectService};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
    Copy,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Upload => "upload",
            TransferKind::Download => "download",
            TransferKind::Copy => "copy",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Planning,
    ResumingOrFresh,
    InProgress,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Planning => "planning",
            TransferState::ResumingOrFresh => "resuming-or-fresh",
            TransferState::InProgress => "in-progress",
            TransferState::Finalizing => "finalizing",
            TransferState::Done => "done",
            TransferState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Logs state transitions of one transfer
#[derive(Debug)]
pub(crate) struct Lifecycle {
    kind: TransferKind,
    state: TransferState,
    started: Instant,
}

impl Lifecycle {
    pub(crate) fn start(kind: TransferKind) -> Self {
        debug!(kind = %kind, state = %TransferState::Planning, "Transfer state");
        Self {
            kind,
            state: TransferState::Planning,
            started: Instant::now(),
        }
    }

    pub(crate) fn advance(&mut self, to: TransferState) {
        debug!(kind = %self.kind, from = %self.state, to = %to, "Transfer state");
        self.state = to;
    }

    pub(crate) fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

/// Interception point invoked with every part result before it is recorded.
///
/// A hook can replace an outcome with an error, for example to fail a chosen
/// part deterministically.
pub trait PartHook: Send + Sync {
    fn after_part(
        &self,
        _kind: TransferKind,
        _part: &Part,
        result: Result<PartOutcome>,
    ) -> Result<PartOutcome> {
        result
    }
}

/// Hook that passes every result through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl PartHook for NoopHook {}

/// Drives multipart transfers against one object service
pub struct TransferManager<S> {
    service: S,
    config: TransferConfig,
    limiter: BandwidthLimiter,
    hook: Arc<dyn PartHook>,
    progress: ProgressPublisher,
    cancel: CancellationToken,
}

impl<S: ObjectService> TransferManager<S> {
    /// Create a manager; the configuration is validated here, before any I/O
    pub fn new(service: S, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let limiter = match (config.max_bandwidth, config.bandwidth_burst) {
            (0, _) => BandwidthLimiter::unlimited(),
            (rate, Some(burst)) => BandwidthLimiter::with_burst(rate, burst),
            (rate, None) => BandwidthLimiter::new(rate),
        };
        Ok(Self {
            service,
            config,
            limiter,
            hook: Arc::new(NoopHook),
            progress: ProgressPublisher::noop(),
            cancel: CancellationToken::new(),
        })
    }

    /// Share a limiter with other managers so they draw from one budget
    pub fn with_limiter(mut self, limiter: BandwidthLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PartHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_progress(mut self, progress: ProgressPublisher) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn limiter(&self) -> &BandwidthLimiter {
        &self.limiter
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Save the checkpoint when checkpointing is on
    fn persist(&self, checkpoint: &mut Checkpoint, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => checkpoint.save(path),
            None => Ok(()),
        }
    }

    fn forget(&self, path: Option<&Path>) {
        if let Some(path) = path {
            if let Err(e) = Checkpoint::remove(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove checkpoint");
            }
        }
    }

    /// Abort the session of a checkpoint that was thrown away
    fn discard(&self, discarded: Option<Checkpoint>) {
        let Some(old) = discarded else { return };
        if let Some(ref session_id) = old.session_id {
            match self.service.abort_session(&old.destination, session_id) {
                Ok(()) => debug!(session_id = %session_id, "Aborted superseded session"),
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Superseded session not aborted")
                }
            }
        }
    }

    fn announce(&self, checkpoint: &Checkpoint, total_bytes: u64) {
        info!(
            kind = %checkpoint.kind,
            source = %checkpoint.source,
            destination = %checkpoint.destination,
            total_bytes,
            parts = checkpoint.parts.len(),
            resumed_parts = checkpoint.done_count(),
            "Transfer started"
        );
        self.progress.publish(ProgressEvent::TransferStarted {
            kind: checkpoint.kind,
            source: checkpoint.source.clone(),
            destination: checkpoint.destination.clone(),
            total_bytes,
            total_parts: checkpoint.parts.len(),
            resumed_parts: checkpoint.done_count(),
            timestamp: ProgressEvent::current_timestamp(),
        });
    }

    /// Run every pending part, recording each success in the checkpoint.
    ///
    /// Returns the run summary and the bytes moved by this invocation.
    fn run_parts<E>(
        &self,
        checkpoint: &mut Checkpoint,
        checkpoint_path: Option<&Path>,
        total_bytes: u64,
        executor: &E,
    ) -> Result<(RunSummary, u64)>
    where
        E: PartExecutor + ?Sized,
    {
        let parts = checkpoint.parts.clone();
        let done = checkpoint.done_parts();
        let mut moved = 0u64;

        let summary = scheduler::run(
            &parts,
            &done,
            self.config.routines,
            executor,
            &self.cancel,
            |part, result| {
                match result {
                    Ok(outcome) => {
                        moved += outcome.bytes;
                        checkpoint.record(
                            part.number,
                            PartReceipt {
                                etag: outcome.etag.clone(),
                                bytes: outcome.bytes,
                                crc64: outcome.crc64,
                            },
                        );
                        self.progress.publish(ProgressEvent::PartCompleted {
                            part_number: part.number,
                            part_bytes: outcome.bytes,
                            consumed_bytes: checkpoint.completed_bytes(),
                            total_bytes,
                            timestamp: ProgressEvent::current_timestamp(),
                        });
                    }
                    Err(e) => {
                        warn!(part = part.number, error = %e, "Part failed");
                        self.progress.publish(ProgressEvent::PartFailed {
                            part_number: part.number,
                            error: e.to_string(),
                            timestamp: ProgressEvent::current_timestamp(),
                        });
                    }
                }
                self.persist(checkpoint, checkpoint_path)
            },
        )?;
        Ok((summary, moved))
    }

    /// Report a failed transfer and release what cannot be resumed
    fn fail(
        &self,
        lifecycle: &mut Lifecycle,
        checkpoint: &Checkpoint,
        checkpoint_path: Option<&Path>,
        error: TransferError,
    ) -> TransferError {
        lifecycle.advance(TransferState::Failed);
        let session_consumed = error.is_checksum_mismatch() || error.is_stale_checkpoint();
        if checkpoint_path.is_none() && !session_consumed {
            if let Some(ref session_id) = checkpoint.session_id {
                if let Err(e) = self
                    .service
                    .abort_session(&checkpoint.destination, session_id)
                {
                    warn!(session_id = %session_id, error = %e, "Failed to abort session");
                }
            }
        }
        warn!(
            kind = %checkpoint.kind,
            category = %error.category(),
            error = %error,
            resumable = checkpoint_path.is_some() && !session_consumed,
            "Transfer failed"
        );
        self.progress.publish(ProgressEvent::TransferFailed {
            error: error.to_string(),
            consumed_bytes: checkpoint.completed_bytes(),
            timestamp: ProgressEvent::current_timestamp(),
        });
        error
    }

    fn complete(&self, lifecycle: &mut Lifecycle, total_bytes: u64, crc64: Option<u64>) {
        lifecycle.advance(TransferState::Done);
        let duration = lifecycle.elapsed();
        info!(
            total_bytes,
            duration_ms = duration.as_millis() as u64,
            crc64 = crc64.unwrap_or_default(),
            "Transfer completed"
        );
        self.progress.publish(ProgressEvent::TransferCompleted {
            total_bytes,
            duration_ms: duration.as_millis() as u64,
            crc64,
            timestamp: ProgressEvent::current_timestamp(),
        });
    }
}

/// Parts in ascending order with the ETag each one was accepted under
fn completed_parts(checkpoint: &Checkpoint) -> Result<Vec<CompletedPart>> {
    checkpoint
        .parts
        .iter()
        .map(|part| {
            checkpoint
                .receipts
                .get(&part.number)
                .and_then(|r| r.etag.clone())
                .filter(|_| checkpoint.is_done(part.number))
                .map(|etag| CompletedPart {
                    number: part.number,
                    etag,
                })
                .ok_or_else(|| {
                    TransferError::Checkpoint(format!("part {} has no receipt", part.number))
                })
        })
        .collect()
}

/// CRC-64 of the whole object folded from per-part receipts
fn combined_crc(checkpoint: &Checkpoint) -> Option<u64> {
    let mut acc = ChecksumAccumulator::new();
    for (_, receipt) in checkpoint.ordered_receipts() {
        acc.combine(receipt.crc64?, receipt.bytes);
    }
    Some(acc.value())
}
