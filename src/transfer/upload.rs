//! Local file to remote object

use super::{combined_crc, completed_parts, Lifecycle, TransferKind, TransferManager, TransferState};
use crate::core::checkpoint::{self, Checkpoint, CheckpointSeed, TransferIdentity};
use crate::core::checksum::Crc64Reader;
use crate::core::chunker::{self, Part};
use crate::core::retry::with_retry;
use crate::core::scheduler::PartOutcome;
use crate::error::{Result, TransferError};
use crate::protocol::{ObjectService, PartPayload};
use crate::stats::TransferStats;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

impl<S: ObjectService> TransferManager<S> {
    /// Upload `source` to `key`, resuming from a checkpoint when one matches
    pub fn upload(&self, source: &Path, key: &str) -> Result<TransferStats> {
        let kind = TransferKind::Upload;
        let mut lifecycle = Lifecycle::start(kind);

        if key.is_empty() {
            return Err(TransferError::InvalidArgument(
                "destination key is empty".to_string(),
            ));
        }
        let metadata = std::fs::metadata(source).map_err(|e| {
            TransferError::InvalidArgument(format!("cannot stat {}: {}", source.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(TransferError::InvalidArgument(format!(
                "{} is not a regular file",
                source.display()
            )));
        }

        let total_bytes = metadata.len();
        let parts = chunker::plan(total_bytes, self.config.part_sizing)?;
        let identity = TransferIdentity::of_local_file(source, self.config.hash_source_content)?;
        let source_label = source.display().to_string();
        let checkpoint_path = checkpoint::resolve_path(
            &self.config.checkpoint,
            kind,
            &source_label,
            key,
            Some(source),
        );

        lifecycle.advance(TransferState::ResumingOrFresh);
        let loaded = checkpoint_path.as_deref().and_then(Checkpoint::load);
        let seed = CheckpointSeed {
            kind,
            identity,
            source: source_label,
            destination: key.to_string(),
            parts,
        };
        let reconciled = checkpoint::reconcile(
            loaded,
            seed,
            |cp| match cp.session_id {
                Some(ref session_id) => self.service.session_exists(key, session_id),
                None => Ok(false),
            },
            || self.service.open_session(key).map(Some),
        )?;
        let resumed = reconciled.resumed();
        self.discard(reconciled.discarded);
        let mut checkpoint = reconciled.checkpoint;

        match self.upload_session(
            &mut lifecycle,
            source,
            key,
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

    fn upload_session(
        &self,
        lifecycle: &mut Lifecycle,
        source: &Path,
        key: &str,
        checkpoint: &mut Checkpoint,
        checkpoint_path: Option<&Path>,
    ) -> Result<TransferStats> {
        let session_id = checkpoint
            .session_id
            .clone()
            .ok_or_else(|| TransferError::Checkpoint("upload has no session".to_string()))?;
        let total_bytes = checkpoint.identity.size();
        self.persist(checkpoint, checkpoint_path)?;
        self.announce(checkpoint, total_bytes);

        lifecycle.advance(TransferState::InProgress);
        let executor = |part: &Part| {
            let label = format!("upload part {}", part.number);
            let result = with_retry(&self.config.retry, &label, |_| {
                self.upload_part(source, key, &session_id, part)
            });
            self.hook.after_part(TransferKind::Upload, part, result)
        };
        let (summary, moved) = self.run_parts(checkpoint, checkpoint_path, total_bytes, &executor)?;

        lifecycle.advance(TransferState::Finalizing);
        let current = TransferIdentity::of_local_file(source, self.config.hash_source_content)?;
        if current != checkpoint.identity {
            self.forget(checkpoint_path);
            if let Err(e) = self.service.abort_session(key, &session_id) {
                debug!(error = %e, "Session of changed source not aborted");
            }
            return Err(TransferError::StaleCheckpoint(format!(
                "{} changed during the upload",
                source.display()
            )));
        }
        if !self.service.session_exists(key, &session_id)? {
            self.forget(checkpoint_path);
            return Err(TransferError::StaleCheckpoint(format!(
                "session {} for {} no longer exists",
                session_id, key
            )));
        }

        let parts = completed_parts(checkpoint)?;
        let descriptor = self.service.commit_session(key, &session_id, &parts)?;
        let local_crc = combined_crc(checkpoint);

        if self.config.verify_checksum {
            if let (Some(expected), Some(actual)) = (local_crc, descriptor.crc64) {
                if expected != actual {
                    self.forget(checkpoint_path);
                    return Err(TransferError::ChecksumMismatch {
                        target: key.to_string(),
                        expected,
                        actual,
                    });
                }
            } else {
                warn!(key, "Remote did not report a CRC-64, skipping verification");
            }
        }

        self.forget(checkpoint_path);
        self.complete(lifecycle, total_bytes, local_crc);

        let mut stats = TransferStats::new(TransferKind::Upload);
        stats.total_bytes = total_bytes;
        stats.parts_total = checkpoint.parts.len();
        stats.parts_transferred = summary.succeeded;
        stats.parts_skipped = summary.skipped;
        stats.bytes_transferred = moved;
        stats.duration = lifecycle.elapsed();
        stats.crc64 = local_crc;
        stats.etag = descriptor.etag;
        Ok(stats)
    }

    /// Stream one byte range of the file into the session
    fn upload_part(
        &self,
        source: &Path,
        key: &str,
        session_id: &str,
        part: &Part,
    ) -> Result<PartOutcome> {
        let mut file = File::open(source)?;
        file.seek(SeekFrom::Start(part.offset))?;
        let mut reader = Crc64Reader::new(self.limiter.throttle(file.take(part.size)));

        let etag = self.service.submit_part(
            key,
            session_id,
            part.number,
            PartPayload::Data {
                body: Box::new(&mut reader),
                size: part.size,
            },
        )?;

        if reader.bytes_read() != part.size {
            return Err(TransferError::InvalidArgument(format!(
                "{} yielded {} of {} bytes for part {}",
                source.display(),
                reader.bytes_read(),
                part.size,
                part.number
            )));
        }
        debug!(part = part.number, bytes = part.size, "Part uploaded");
        Ok(PartOutcome::new(part.number, part.size)
            .with_crc64(reader.crc64())
            .with_etag(etag))
    }
}
