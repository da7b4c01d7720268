/*!
 * Durable transfer checkpoints
 *
 * A checkpoint records the plan, the remote session and which parts have
 * completed. It is rewritten atomically (temp file + rename) after every part
 * result and removed once the transfer finalizes. A checkpoint that fails
 * validation is never an error: the transfer simply starts fresh.
 */

use crate::config::CheckpointConfig;
use crate::core::chunker::Part;
use crate::error::{Result, TransferError};
use crate::protocol::ObjectMeta;
use crate::transfer::TransferKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// File header identifying a partwise checkpoint
pub const CHECKPOINT_MAGIC: &str = "PARTWISE-CHECKPOINT";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Snapshot of the transfer source, compared on resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferIdentity {
    LocalFile {
        size: u64,
        modified_secs: i64,
        modified_nanos: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_hash: Option<String>,
    },
    RemoteObject {
        size: u64,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

impl TransferIdentity {
    /// Identity of a local file from its metadata, optionally with a BLAKE3 hash
    pub fn of_local_file(path: &Path, hash_content: bool) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let (modified_secs, modified_nanos) = match metadata.modified()?.duration_since(UNIX_EPOCH)
        {
            Ok(since) => (since.as_secs() as i64, since.subsec_nanos()),
            Err(before) => (-(before.duration().as_secs() as i64), 0),
        };

        let content_hash = if hash_content {
            let mut hasher = blake3::Hasher::new();
            let mut reader = BufReader::new(File::open(path)?);
            io::copy(&mut reader, &mut hasher)?;
            Some(hasher.finalize().to_hex().to_string())
        } else {
            None
        };

        Ok(TransferIdentity::LocalFile {
            size: metadata.len(),
            modified_secs,
            modified_nanos,
            content_hash,
        })
    }

    pub fn of_remote(meta: &ObjectMeta) -> Self {
        TransferIdentity::RemoteObject {
            size: meta.size,
            etag: meta.etag.clone(),
            last_modified: meta.last_modified.clone(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            TransferIdentity::LocalFile { size, .. }
            | TransferIdentity::RemoteObject { size, .. } => *size,
        }
    }
}

/// What the remote side (or the local writer) returned for a completed part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
}

/// Persisted state of one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub magic: String,
    pub format_version: u32,
    /// SHA-256 over the document with this field blank
    #[serde(default)]
    pub fingerprint: String,
    pub kind: TransferKind,
    pub identity: TransferIdentity,
    pub source: String,
    pub destination: String,
    pub session_id: Option<String>,
    pub parts: Vec<Part>,
    pub part_done: Vec<bool>,
    #[serde(default)]
    pub receipts: BTreeMap<u32, PartReceipt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(seed: CheckpointSeed, session_id: Option<String>) -> Self {
        let now = Utc::now();
        let part_done = vec![false; seed.parts.len()];
        Self {
            magic: CHECKPOINT_MAGIC.to_string(),
            format_version: FORMAT_VERSION,
            fingerprint: String::new(),
            kind: seed.kind,
            identity: seed.identity,
            source: seed.source,
            destination: seed.destination,
            session_id,
            parts: seed.parts,
            part_done,
            receipts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Load and validate a checkpoint; anything unusable yields `None`
    pub fn load(path: &Path) -> Option<Self> {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read checkpoint, starting fresh");
                return None;
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_slice(&contents) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt checkpoint, starting fresh");
                return None;
            }
        };

        match checkpoint.validate() {
            Ok(()) => Some(checkpoint),
            Err(reason) => {
                warn!(path = %path.display(), reason, "Invalid checkpoint, starting fresh");
                None
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.magic != CHECKPOINT_MAGIC {
            return Err("bad magic");
        }
        if self.format_version != FORMAT_VERSION {
            return Err("unsupported format version");
        }
        if self.parts.len() != self.part_done.len() {
            return Err("part table length mismatch");
        }
        match self.compute_fingerprint() {
            Ok(expected) if expected == self.fingerprint => Ok(()),
            Ok(_) => Err("fingerprint mismatch"),
            Err(_) => Err("fingerprint could not be computed"),
        }
    }

    fn compute_fingerprint(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.fingerprint.clear();
        let bytes = serde_json::to_vec(&unsigned)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Write atomically: the file at `path` is always either the old or the new state
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        self.fingerprint = self.compute_fingerprint()?;
        let bytes = serde_json::to_vec_pretty(self)?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| {
            TransferError::Checkpoint(format!("cannot create {}: {}", parent.display(), e))
        })?;

        let mut temp = NamedTempFile::new_in(&parent)
            .map_err(|e| TransferError::Checkpoint(format!("cannot stage checkpoint: {}", e)))?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| {
            TransferError::Checkpoint(format!("cannot persist {}: {}", path.display(), e.error))
        })?;
        debug!(path = %path.display(), done = self.done_count(), "Checkpoint saved");
        Ok(())
    }

    /// Delete the checkpoint file; a missing file is fine
    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::Checkpoint(format!(
                "cannot remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn index_of(&self, number: u32) -> Option<usize> {
        let index = number.checked_sub(1)? as usize;
        (self.parts.get(index)?.number == number).then_some(index)
    }

    /// Mark a part done and keep its receipt
    pub fn record(&mut self, number: u32, receipt: PartReceipt) {
        if let Some(index) = self.index_of(number) {
            self.part_done[index] = true;
            self.receipts.insert(number, receipt);
        }
    }

    pub fn is_done(&self, number: u32) -> bool {
        self.index_of(number)
            .map(|index| self.part_done[index])
            .unwrap_or(false)
    }

    pub fn done_parts(&self) -> HashSet<u32> {
        self.parts
            .iter()
            .zip(&self.part_done)
            .filter(|(_, done)| **done)
            .map(|(part, _)| part.number)
            .collect()
    }

    pub fn done_count(&self) -> usize {
        self.part_done.iter().filter(|done| **done).count()
    }

    pub fn pending_count(&self) -> usize {
        self.parts.len() - self.done_count()
    }

    pub fn is_complete(&self) -> bool {
        self.part_done.iter().all(|done| *done)
    }

    /// Bytes of every part marked done
    pub fn completed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .zip(&self.part_done)
            .filter(|(_, done)| **done)
            .map(|(part, _)| part.size)
            .sum()
    }

    /// Receipts in ascending part order
    pub fn ordered_receipts(&self) -> impl Iterator<Item = (u32, &PartReceipt)> {
        self.receipts.iter().map(|(number, receipt)| (*number, receipt))
    }
}

/// Everything needed to start a fresh checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSeed {
    pub kind: TransferKind,
    pub identity: TransferIdentity,
    pub source: String,
    pub destination: String,
    pub parts: Vec<Part>,
}

/// Why a transfer did not resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    NoCheckpoint,
    KindMismatch,
    IdentityChanged,
    EndpointsChanged,
    PlanChanged,
    NotResumable,
}

impl FreshReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshReason::NoCheckpoint => "no checkpoint",
            FreshReason::KindMismatch => "transfer kind differs",
            FreshReason::IdentityChanged => "source changed",
            FreshReason::EndpointsChanged => "source or destination differs",
            FreshReason::PlanChanged => "part plan differs",
            FreshReason::NotResumable => "recorded session is gone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    Resumed { done_parts: usize },
    Fresh { reason: FreshReason },
}

/// Outcome of reconciling a loaded checkpoint with the current transfer
#[derive(Debug)]
pub struct Reconciled {
    pub checkpoint: Checkpoint,
    pub decision: ResumeDecision,
    /// A loaded checkpoint that was thrown away; its session may need aborting
    pub discarded: Option<Checkpoint>,
}

impl Reconciled {
    pub fn resumed(&self) -> bool {
        matches!(self.decision, ResumeDecision::Resumed { .. })
    }
}

fn mismatch(loaded: &Checkpoint, seed: &CheckpointSeed) -> Option<FreshReason> {
    if loaded.kind != seed.kind {
        Some(FreshReason::KindMismatch)
    } else if loaded.source != seed.source || loaded.destination != seed.destination {
        Some(FreshReason::EndpointsChanged)
    } else if loaded.identity != seed.identity {
        Some(FreshReason::IdentityChanged)
    } else if loaded.parts != seed.parts {
        Some(FreshReason::PlanChanged)
    } else {
        None
    }
}

/// Decide between resuming `loaded` and starting fresh.
///
/// `still_resumable` is consulted only for a checkpoint that matches the
/// current transfer; `open_session` runs only on a fresh start.
pub fn reconcile<V, O>(
    loaded: Option<Checkpoint>,
    seed: CheckpointSeed,
    still_resumable: V,
    open_session: O,
) -> Result<Reconciled>
where
    V: FnOnce(&Checkpoint) -> Result<bool>,
    O: FnOnce() -> Result<Option<String>>,
{
    let (reason, discarded) = match loaded {
        None => (FreshReason::NoCheckpoint, None),
        Some(loaded) => match mismatch(&loaded, &seed) {
            Some(reason) => (reason, Some(loaded)),
            None => {
                if still_resumable(&loaded)? {
                    let done_parts = loaded.done_count();
                    info!(
                        done_parts,
                        total_parts = loaded.parts.len(),
                        "Resuming from checkpoint"
                    );
                    return Ok(Reconciled {
                        checkpoint: loaded,
                        decision: ResumeDecision::Resumed { done_parts },
                        discarded: None,
                    });
                }
                (FreshReason::NotResumable, Some(loaded))
            }
        },
    };

    if discarded.is_some() {
        info!(reason = reason.as_str(), "Checkpoint discarded, starting fresh");
    }
    let session_id = open_session()?;
    Ok(Reconciled {
        checkpoint: Checkpoint::new(seed, session_id),
        decision: ResumeDecision::Fresh { reason },
        discarded,
    })
}

/// Where the checkpoint for a transfer lives, `None` when checkpointing is off.
///
/// An explicit path wins, then a name derived from the endpoints inside the
/// configured directory, then `<local file>.cp`, then the temp directory.
pub fn resolve_path(
    config: &CheckpointConfig,
    kind: TransferKind,
    source: &str,
    destination: &str,
    local_file: Option<&Path>,
) -> Option<PathBuf> {
    if !config.enabled {
        return None;
    }
    if let Some(ref path) = config.path {
        return Some(path.clone());
    }

    let derived = || {
        let digest = Sha256::digest(format!("{}|{}|{}", kind.as_str(), source, destination));
        format!("{}.cp", &hex::encode(digest)[..32])
    };

    if let Some(ref dir) = config.dir {
        return Some(dir.join(derived()));
    }
    match local_file {
        Some(file) => {
            let mut name = file.as_os_str().to_os_string();
            name.push(".cp");
            Some(PathBuf::from(name))
        }
        None => Some(std::env::temp_dir().join(derived())),
    }
}
