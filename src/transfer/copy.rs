//! Server-side copy between two objects of one service

use super::{completed_parts, Lifecycle, TransferKind, TransferManager, TransferState};
use crate::core::checkpoint::{self, Checkpoint, CheckpointSeed, TransferIdentity};
use crate::core::chunker::{self, Part};
use crate::core::retry::with_retry;
use crate::core::scheduler::PartOutcome;
use crate::error::{Result, TransferError};
use crate::protocol::{ObjectMeta, ObjectService, PartPayload};
use crate::stats::TransferStats;
use std::path::Path;
use tracing::{debug, warn};

impl<S: ObjectService> TransferManager<S> {
    /// Copy `source_key` to `dest_key` with ranged part copies.
    ///
    /// Without an explicit checkpoint location the checkpoint goes to the
    /// system temp directory.
    pub fn copy(&self, source_key: &str, dest_key: &str) -> Result<TransferStats> {
        let kind = TransferKind::Copy;
        let mut lifecycle = Lifecycle::start(kind);

        if source_key.is_empty() || dest_key.is_empty() {
            return Err(TransferError::InvalidArgument(
                "source and destination keys must be non-empty".to_string(),
            ));
        }
        if source_key == dest_key {
            return Err(TransferError::InvalidArgument(format!(
                "cannot copy {} onto itself",
                source_key
            )));
        }

        let meta = self.service.head_object(source_key)?;
        let parts = chunker::plan(meta.size, self.config.part_sizing)?;
        let checkpoint_path =
            checkpoint::resolve_path(&self.config.checkpoint, kind, source_key, dest_key, None);

        lifecycle.advance(TransferState::ResumingOrFresh);
        let loaded = checkpoint_path.as_deref().and_then(Checkpoint::load);
        let seed = CheckpointSeed {
            kind,
            identity: TransferIdentity::of_remote(&meta),
            source: source_key.to_string(),
            destination: dest_key.to_string(),
            parts,
        };
        let reconciled = checkpoint::reconcile(
            loaded,
            seed,
            |cp| match cp.session_id {
                Some(ref session_id) => self.service.session_exists(dest_key, session_id),
                None => Ok(false),
            },
            || self.service.open_session(dest_key).map(Some),
        )?;
        let resumed = reconciled.resumed();
        self.discard(reconciled.discarded);
        let mut checkpoint = reconciled.checkpoint;

        match self.copy_session(
            &mut lifecycle,
            &meta,
            dest_key,
            &mut checkpoint,
            checkpoint_path.as_deref(),
        ) {
            Ok(mut stats) => {
                stats.resumed = resumed;
                Ok(stats)
            }
            Err(e) => Err(self.fail(&mut lifecycle, &checkpoint, checkpoint_path.as_deref(), e)),
        }
    }

    fn copy_session(
        &self,
        lifecycle: &mut Lifecycle,
        source: &ObjectMeta,
        dest_key: &str,
        checkpoint: &mut Checkpoint,
        checkpoint_path: Option<&Path>,
    ) -> Result<TransferStats> {
        let session_id = checkpoint
            .session_id
            .clone()
            .ok_or_else(|| TransferError::Checkpoint("copy has no session".to_string()))?;
        let total_bytes = source.size;
        self.persist(checkpoint, checkpoint_path)?;
        self.announce(checkpoint, total_bytes);

        lifecycle.advance(TransferState::InProgress);
        let source_key = source.key.as_str();
        let executor = |part: &Part| {
            let label = format!("copy part {}", part.number);
            let result = with_retry(&self.config.retry, &label, |_| {
                let etag = self.service.submit_part(
                    dest_key,
                    &session_id,
                    part.number,
                    PartPayload::CopyRange {
                        source_key,
                        offset: part.offset,
                        size: part.size,
                    },
                )?;
                debug!(part = part.number, bytes = part.size, "Part copied");
                Ok(PartOutcome::new(part.number, part.size).with_etag(etag))
            });
            self.hook.after_part(TransferKind::Copy, part, result)
        };
        let (summary, moved) = self.run_parts(checkpoint, checkpoint_path, total_bytes, &executor)?;

        lifecycle.advance(TransferState::Finalizing);
        let current = self.service.head_object(source_key)?;
        if TransferIdentity::of_remote(&current) != checkpoint.identity {
            self.forget(checkpoint_path);
            if let Err(e) = self.service.abort_session(dest_key, &session_id) {
                debug!(error = %e, "Session of changed source not aborted");
            }
            return Err(TransferError::StaleCheckpoint(format!(
                "{} changed during the copy",
                source_key
            )));
        }
        if !self.service.session_exists(dest_key, &session_id)? {
            self.forget(checkpoint_path);
            return Err(TransferError::StaleCheckpoint(format!(
                "session {} for {} no longer exists",
                session_id, dest_key
            )));
        }

        let parts = completed_parts(checkpoint)?;
        let descriptor = self.service.commit_session(dest_key, &session_id, &parts)?;

        if self.config.verify_checksum {
            match (current.crc64, descriptor.crc64) {
                (Some(expected), Some(actual)) if expected != actual => {
                    self.forget(checkpoint_path);
                    return Err(TransferError::ChecksumMismatch {
                        target: dest_key.to_string(),
                        expected,
                        actual,
                    });
                }
                (Some(_), Some(_)) => {}
                _ => warn!(dest_key, "CRC-64 not reported for both objects, skipping verification"),
            }
        }

        self.forget(checkpoint_path);
        self.complete(lifecycle, total_bytes, descriptor.crc64);

        let mut stats = TransferStats::new(TransferKind::Copy);
        stats.total_bytes = total_bytes;
        stats.parts_total = checkpoint.parts.len();
        stats.parts_transferred = summary.succeeded;
        stats.parts_skipped = summary.skipped;
        stats.bytes_transferred = moved;
        stats.duration = lifecycle.elapsed();
        stats.crc64 = descriptor.crc64;
        stats.etag = descriptor.etag;
        Ok(stats)
    }
}
