//! Remote object to local file
//!
//! Parts are written at their offsets into `<dest>.partwise-tmp`, which is
//! renamed over the destination only after the whole object verified.

use super::{combined_crc, Lifecycle, TransferKind, TransferManager, TransferState};
use crate::core::checkpoint::{self, Checkpoint, CheckpointSeed, TransferIdentity};
use crate::core::checksum::Crc64Reader;
use crate::core::chunker::{self, Part};
use crate::core::retry::with_retry;
use crate::core::scheduler::PartOutcome;
use crate::error::{Result, TransferError};
use crate::protocol::ObjectService;
use crate::stats::TransferStats;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix of the file a download is staged in
const STAGING_SUFFIX: &str = ".partwise-tmp";

/// Where a download into `dest` is staged
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

fn remove_staged(staged: &Path) {
    match fs::remove_file(staged) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staged.display(), error = %e, "Failed to remove staged file"),
    }
}

/// Whether the staged file still holds the bytes the checkpoint recorded.
///
/// Every completed range is re-read and compared with its receipt CRC, so a
/// staged file that was truncated and regrown is not resumed.
fn staged_matches(staged: &Path, checkpoint: &Checkpoint, total_bytes: u64) -> bool {
    match fs::metadata(staged) {
        Ok(meta) if meta.len() == total_bytes => {}
        _ => return false,
    }
    for (number, receipt) in checkpoint.ordered_receipts() {
        let (Some(expected), Some(part)) = (
            receipt.crc64,
            checkpoint.parts.iter().find(|p| p.number == number),
        ) else {
            continue;
        };
        match range_crc(staged, part) {
            Ok(actual) if actual == expected => {}
            Ok(_) => {
                warn!(part = number, "Staged range no longer matches its receipt");
                return false;
            }
            Err(e) => {
                warn!(part = number, error = %e, "Staged range unreadable");
                return false;
            }
        }
    }
    true
}

fn range_crc(staged: &Path, part: &Part) -> io::Result<u64> {
    let mut file = fs::File::open(staged)?;
    file.seek(SeekFrom::Start(part.offset))?;
    let mut reader = Crc64Reader::new(file.take(part.size));
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.crc64())
}

fn validate_destination(dest: &Path) -> Result<()> {
    if dest.as_os_str().is_empty() {
        return Err(TransferError::InvalidArgument(
            "destination path is empty".to_string(),
        ));
    }
    if dest.is_dir() {
        return Err(TransferError::InvalidArgument(format!(
            "{} is a directory",
            dest.display()
        )));
    }
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err(TransferError::InvalidArgument(format!(
                "parent directory {} does not exist",
                parent.display()
            )))
        }
        _ => Ok(()),
    }
}

impl<S: ObjectService> TransferManager<S> {
    /// Download `key` into `dest`, resuming a staged file when the checkpoint matches
    pub fn download(&self, key: &str, dest: &Path) -> Result<TransferStats> {
        let kind = TransferKind::Download;
        let mut lifecycle = Lifecycle::start(kind);

        if key.is_empty() {
            return Err(TransferError::InvalidArgument("source key is empty".to_string()));
        }
        validate_destination(dest)?;
        let staged = staging_path(dest);
        let staged_existed = staged.exists();
        // Fail on an unwritable destination before talking to the service
        let staged_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&staged)
            .map_err(|e| {
                TransferError::InvalidArgument(format!("cannot write {}: {}", staged.display(), e))
            })?;

        let planned = self.service.head_object(key).and_then(|meta| {
            let parts = chunker::plan(meta.size, self.config.part_sizing)?;
            Ok((meta, parts))
        });
        let (meta, parts) = match planned {
            Ok(planned) => planned,
            Err(e) => {
                drop(staged_file);
                if !staged_existed {
                    remove_staged(&staged);
                }
                return Err(e);
            }
        };
        let total_bytes = meta.size;
        let dest_label = dest.display().to_string();
        let checkpoint_path =
            checkpoint::resolve_path(&self.config.checkpoint, kind, key, &dest_label, Some(dest));

        lifecycle.advance(TransferState::ResumingOrFresh);
        let loaded = checkpoint_path.as_deref().and_then(Checkpoint::load);
        let seed = CheckpointSeed {
            kind,
            identity: TransferIdentity::of_remote(&meta),
            source: key.to_string(),
            destination: dest_label,
            parts,
        };
        let reconciled = checkpoint::reconcile(
            loaded,
            seed,
            |cp| Ok(staged_matches(&staged, cp, total_bytes)),
            || Ok(None),
        )?;
        let resumed = reconciled.resumed();
        if !resumed {
            staged_file.set_len(0)?;
            staged_file.set_len(total_bytes)?;
        }
        drop(staged_file);
        let mut checkpoint = reconciled.checkpoint;

        match self.download_parts(
            &mut lifecycle,
            key,
            dest,
            &staged,
            &mut checkpoint,
            checkpoint_path.as_deref(),
        ) {
            Ok(mut stats) => {
                stats.resumed = resumed;
                Ok(stats)
            }
            Err(e) => {
                if checkpoint_path.is_none() {
                    remove_staged(&staged);
                }
                Err(self.fail(&mut lifecycle, &checkpoint, checkpoint_path.as_deref(), e))
            }
        }
    }

    fn download_parts(
        &self,
        lifecycle: &mut Lifecycle,
        key: &str,
        dest: &Path,
        staged: &Path,
        checkpoint: &mut Checkpoint,
        checkpoint_path: Option<&Path>,
    ) -> Result<TransferStats> {
        let total_bytes = checkpoint.identity.size();
        self.persist(checkpoint, checkpoint_path)?;
        self.announce(checkpoint, total_bytes);

        lifecycle.advance(TransferState::InProgress);
        let executor = |part: &Part| {
            let label = format!("download part {}", part.number);
            let result = with_retry(&self.config.retry, &label, |_| {
                self.download_part(key, staged, part)
            });
            self.hook.after_part(TransferKind::Download, part, result)
        };
        let (summary, moved) = self.run_parts(checkpoint, checkpoint_path, total_bytes, &executor)?;

        lifecycle.advance(TransferState::Finalizing);
        let current = self.service.head_object(key)?;
        if TransferIdentity::of_remote(&current) != checkpoint.identity {
            self.forget(checkpoint_path);
            remove_staged(staged);
            return Err(TransferError::StaleCheckpoint(format!(
                "{} changed during the download",
                key
            )));
        }

        let staged_len = fs::metadata(staged)?.len();
        if staged_len != total_bytes {
            self.forget(checkpoint_path);
            remove_staged(staged);
            return Err(TransferError::StaleCheckpoint(format!(
                "staged file holds {} bytes, expected {}",
                staged_len, total_bytes
            )));
        }

        let local_crc = combined_crc(checkpoint);
        if self.config.verify_checksum {
            if let (Some(actual), Some(expected)) = (local_crc, current.crc64) {
                if expected != actual {
                    self.forget(checkpoint_path);
                    remove_staged(staged);
                    return Err(TransferError::ChecksumMismatch {
                        target: key.to_string(),
                        expected,
                        actual,
                    });
                }
            } else {
                warn!(key, "Object has no CRC-64, skipping verification");
            }
        }

        fs::rename(staged, dest)?;
        self.forget(checkpoint_path);
        self.complete(lifecycle, total_bytes, local_crc);

        let mut stats = TransferStats::new(TransferKind::Download);
        stats.total_bytes = total_bytes;
        stats.parts_total = checkpoint.parts.len();
        stats.parts_transferred = summary.succeeded;
        stats.parts_skipped = summary.skipped;
        stats.bytes_transferred = moved;
        stats.duration = lifecycle.elapsed();
        stats.crc64 = local_crc;
        stats.etag = current.etag;
        Ok(stats)
    }

    /// Fetch one range and write it at its offset in the staged file
    fn download_part(&self, key: &str, staged: &Path, part: &Part) -> Result<PartOutcome> {
        if part.size == 0 {
            return Ok(PartOutcome::new(part.number, 0).with_crc64(0));
        }

        let body = self.service.get_range(key, part.offset, part.size)?;
        let mut reader = Crc64Reader::new(self.limiter.throttle(body.take(part.size)));

        let mut file = OpenOptions::new().write(true).open(staged)?;
        file.seek(SeekFrom::Start(part.offset))?;
        let mut writer = BufWriter::new(file);
        let copied = io::copy(&mut reader, &mut writer)?;
        if copied != part.size {
            return Err(TransferError::Transport(format!(
                "range of part {} ended after {} of {} bytes",
                part.number, copied, part.size
            )));
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;

        debug!(part = part.number, bytes = part.size, "Part downloaded");
        Ok(PartOutcome::new(part.number, part.size).with_crc64(reader.crc64()))
    }
}
