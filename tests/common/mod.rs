#![allow(dead_code)]

//! Shared fixtures for the integration tests

use partwise::core::chunker::Part;
use partwise::protocol::{CompletedPart, ObjectDescriptor, ObjectMeta, ObjectService, PartPayload};
use partwise::{LocalObjectStore, PartHook, PartOutcome, Result, TransferError, TransferKind};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Deterministic pseudo-random bytes
pub fn random_bytes(size: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; size];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Write `size` random bytes to `dir/name`
pub fn random_file(dir: &Path, name: &str, size: usize, seed: u64) -> (PathBuf, Vec<u8>) {
    let data = random_bytes(size, seed);
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

/// Fails one chosen part with a transport error
pub struct FailOnPart {
    part: u32,
}

impl FailOnPart {
    pub fn new(part: u32) -> Self {
        Self { part }
    }
}

impl PartHook for FailOnPart {
    fn after_part(
        &self,
        _kind: TransferKind,
        part: &Part,
        result: Result<PartOutcome>,
    ) -> Result<PartOutcome> {
        if part.number == self.part {
            return Err(TransferError::Transport(format!(
                "injected failure on part {}",
                part.number
            )));
        }
        result
    }
}

/// Runs `action` when the chosen part finishes, then passes the result through
pub struct OnPart<F> {
    part: u32,
    action: F,
}

impl<F: Fn() + Send + Sync> OnPart<F> {
    pub fn new(part: u32, action: F) -> Self {
        Self { part, action }
    }
}

impl<F: Fn() + Send + Sync> PartHook for OnPart<F> {
    fn after_part(
        &self,
        _kind: TransferKind,
        part: &Part,
        result: Result<PartOutcome>,
    ) -> Result<PartOutcome> {
        if part.number == self.part {
            (self.action)();
        }
        result
    }
}

/// Records which parts were executed
#[derive(Default)]
pub struct CountingHook {
    executed: Mutex<Vec<u32>>,
}

impl CountingHook {
    pub fn count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn executed(&self) -> Vec<u32> {
        let mut parts = self.executed.lock().unwrap().clone();
        parts.sort_unstable();
        parts
    }
}

impl PartHook for CountingHook {
    fn after_part(
        &self,
        _kind: TransferKind,
        part: &Part,
        result: Result<PartOutcome>,
    ) -> Result<PartOutcome> {
        self.executed.lock().unwrap().push(part.number);
        result
    }
}

/// Wraps a store to count calls, inject transient errors and misreport CRCs
pub struct Instrumented {
    pub inner: LocalObjectStore,
    pub heads: AtomicUsize,
    pub submits: AtomicUsize,
    pub opens: AtomicUsize,
    pub aborts: AtomicUsize,
    /// Remaining submit calls that fail with a retryable error
    pub flaky_submits: AtomicUsize,
    /// Report a wrong whole-object CRC from head
    pub corrupt_head_crc: bool,
    /// Report a wrong whole-object CRC from commit
    pub corrupt_commit_crc: bool,
}

impl Instrumented {
    pub fn new(inner: LocalObjectStore) -> Self {
        Self {
            inner,
            heads: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            flaky_submits: AtomicUsize::new(0),
            corrupt_head_crc: false,
            corrupt_commit_crc: false,
        }
    }

    pub fn corrupting(inner: LocalObjectStore) -> Self {
        Self {
            corrupt_head_crc: true,
            corrupt_commit_crc: true,
            ..Self::new(inner)
        }
    }

    /// Only the committed object misreports its CRC
    pub fn corrupting_commits(inner: LocalObjectStore) -> Self {
        Self {
            corrupt_commit_crc: true,
            ..Self::new(inner)
        }
    }

    pub fn flaky(inner: LocalObjectStore, failures: usize) -> Self {
        let svc = Self::new(inner);
        svc.flaky_submits.store(failures, Ordering::SeqCst);
        svc
    }

    fn mangle(enabled: bool, crc: Option<u64>) -> Option<u64> {
        if enabled {
            crc.map(|c| c ^ 1)
        } else {
            crc
        }
    }
}

impl ObjectService for Instrumented {
    fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        let mut meta = self.inner.head_object(key)?;
        meta.crc64 = Self::mangle(self.corrupt_head_crc, meta.crc64);
        Ok(meta)
    }

    fn get_range(&self, key: &str, offset: u64, size: u64) -> Result<Box<dyn Read + Send>> {
        self.inner.get_range(key, offset, size)
    }

    fn open_session(&self, key: &str) -> Result<String> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_session(key)
    }

    fn submit_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        payload: PartPayload<'_>,
    ) -> Result<String> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let take_failure = self
            .flaky_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if take_failure {
            return Err(TransferError::service(503, "ServiceUnavailable", "try again"));
        }
        self.inner.submit_part(key, session_id, part_number, payload)
    }

    fn list_session_parts(&self, key: &str, session_id: &str) -> Result<Vec<CompletedPart>> {
        self.inner.list_session_parts(key, session_id)
    }

    fn commit_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor> {
        let mut descriptor = self.inner.commit_session(key, session_id, parts)?;
        descriptor.crc64 = Self::mangle(self.corrupt_commit_crc, descriptor.crc64);
        Ok(descriptor)
    }

    fn abort_session(&self, key: &str, session_id: &str) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_session(key, session_id)
    }
}
