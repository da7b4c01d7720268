/*!
 * Bounded worker pool that executes pending parts
 *
 * Jobs flow to workers over one crossbeam channel and results come back over
 * another. Results are consumed on the calling thread, so checkpoint updates
 * and progress accounting are serialized without extra locking. At most
 * `routine_count` parts are in flight at any instant.
 */

use crate::core::chunker::Part;
use crate::error::{Result, TransferError};
use crossbeam_channel::{bounded, unbounded};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// What a successfully executed part produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartOutcome {
    pub number: u32,
    pub bytes: u64,
    pub crc64: Option<u64>,
    pub etag: Option<String>,
}

impl PartOutcome {
    pub fn new(number: u32, bytes: u64) -> Self {
        Self {
            number,
            bytes,
            crc64: None,
            etag: None,
        }
    }

    pub fn with_crc64(mut self, crc64: u64) -> Self {
        self.crc64 = Some(crc64);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Executes one part; shared by every worker
pub trait PartExecutor: Sync {
    fn execute(&self, part: &Part) -> Result<PartOutcome>;
}

impl<F> PartExecutor for F
where
    F: Fn(&Part) -> Result<PartOutcome> + Sync,
{
    fn execute(&self, part: &Part) -> Result<PartOutcome> {
        self(part)
    }
}

/// Cooperative cancellation flag, checked before each part is handed out
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counts reported by a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Parts handed to a worker
    pub attempted: usize,
    /// Parts that completed successfully
    pub succeeded: usize,
    /// Parts already done before the run started
    pub skipped: usize,
}

/// Execute every part not in `done`, with at most `routine_count` in flight.
///
/// `on_result` sees each result exactly once, on the calling thread; an error
/// it returns aborts the run like a failed part. After the first failure no
/// new part is started, in-flight parts are allowed to finish, and the first
/// error is returned.
pub fn run<E, R>(
    parts: &[Part],
    done: &HashSet<u32>,
    routine_count: usize,
    executor: &E,
    cancel: &CancellationToken,
    mut on_result: R,
) -> Result<RunSummary>
where
    E: PartExecutor + ?Sized,
    R: FnMut(&Part, &Result<PartOutcome>) -> Result<()>,
{
    let pending: Vec<Part> = parts
        .iter()
        .filter(|p| !done.contains(&p.number))
        .copied()
        .collect();
    let mut summary = RunSummary {
        skipped: parts.len() - pending.len(),
        ..Default::default()
    };

    if pending.is_empty() {
        return Ok(summary);
    }

    if routine_count <= 1 {
        return run_sequential(&pending, executor, cancel, &mut on_result, summary);
    }

    let workers = routine_count.min(pending.len());
    debug!(workers, pending = pending.len(), "Starting part workers");

    let (job_tx, job_rx) = bounded::<Part>(workers);
    let (result_tx, result_rx) = unbounded::<(Part, Result<PartOutcome>)>();

    let mut first_error: Option<TransferError> = None;

    thread::scope(|scope| {
        for worker_id in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for part in job_rx.iter() {
                    let result = execute_guarded(executor, &part);
                    if result_tx.send((part, result)).is_err() {
                        break;
                    }
                }
                debug!(worker_id, "Part worker exiting");
            });
        }
        drop(result_tx);

        let mut queue = pending.iter();
        let mut in_flight = 0usize;

        // Seed one job per worker
        for part in queue.by_ref().take(workers) {
            if cancel.is_cancelled() {
                break;
            }
            if job_tx.send(*part).is_err() {
                break;
            }
            in_flight += 1;
            summary.attempted += 1;
        }

        while in_flight > 0 {
            let (part, result) = match result_rx.recv() {
                Ok(message) => message,
                Err(_) => {
                    first_error.get_or_insert_with(|| {
                        TransferError::Worker("workers exited with parts in flight".to_string())
                    });
                    break;
                }
            };
            in_flight -= 1;

            if result.is_ok() {
                summary.succeeded += 1;
            }
            let callback = on_result(&part, &result);
            if first_error.is_none() {
                if let Err(e) = result {
                    first_error = Some(e.for_part(part.number));
                } else if let Err(e) = callback {
                    first_error = Some(e);
                }
            }

            if first_error.is_some() {
                continue;
            }
            if cancel.is_cancelled() {
                continue;
            }
            if let Some(next) = queue.next() {
                if job_tx.send(*next).is_ok() {
                    in_flight += 1;
                    summary.attempted += 1;
                }
            }
        }

        // Workers drain and exit once the job channel closes
        drop(job_tx);
    });

    if let Some(e) = first_error {
        return Err(e);
    }
    if summary.attempted < pending.len() {
        warn!(
            remaining = pending.len() - summary.attempted,
            "Run cancelled before every part started"
        );
        return Err(TransferError::Cancelled);
    }
    Ok(summary)
}

fn run_sequential<E, R>(
    pending: &[Part],
    executor: &E,
    cancel: &CancellationToken,
    on_result: &mut R,
    mut summary: RunSummary,
) -> Result<RunSummary>
where
    E: PartExecutor + ?Sized,
    R: FnMut(&Part, &Result<PartOutcome>) -> Result<()>,
{
    for part in pending {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        summary.attempted += 1;
        let result = execute_guarded(executor, part);
        if result.is_ok() {
            summary.succeeded += 1;
        }
        on_result(part, &result)?;
        result.map_err(|e| e.for_part(part.number))?;
    }
    Ok(summary)
}

/// Run the executor, turning a panic into a worker error
fn execute_guarded<E: PartExecutor + ?Sized>(executor: &E, part: &Part) -> Result<PartOutcome> {
    match catch_unwind(AssertUnwindSafe(|| executor.execute(part))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(TransferError::Worker(format!(
                "part {} panicked: {}",
                part.number, message
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunker::plan_by_count;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn ok_executor(part: &Part) -> Result<PartOutcome> {
        Ok(PartOutcome::new(part.number, part.size))
    }

    #[test]
    fn test_all_parts_run_once() {
        let parts = plan_by_count(1000, 10).unwrap();
        let seen = Mutex::new(Vec::new());
        let executor = |part: &Part| {
            seen.lock().unwrap().push(part.number);
            ok_executor(part)
        };
        let summary = run(
            &parts,
            &HashSet::new(),
            4,
            &executor,
            &CancellationToken::new(),
            |_, _| Ok(()),
        )
        .unwrap();

        assert_eq!(summary.attempted, 10);
        assert_eq!(summary.succeeded, 10);
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_done_parts_are_skipped() {
        let parts = plan_by_count(100, 5).unwrap();
        let done: HashSet<u32> = [1, 2, 4].into_iter().collect();
        let executed = Mutex::new(Vec::new());
        let executor = |part: &Part| {
            executed.lock().unwrap().push(part.number);
            ok_executor(part)
        };
        let summary = run(&parts, &done, 3, &executor, &CancellationToken::new(), |_, _| {
            Ok(())
        })
        .unwrap();

        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.attempted, 2);
        let mut executed = executed.into_inner().unwrap();
        executed.sort_unstable();
        assert_eq!(executed, vec![3, 5]);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let parts = plan_by_count(64, 16).unwrap();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let executor = |part: &Part| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            ok_executor(part)
        };
        run(
            &parts,
            &HashSet::new(),
            3,
            &executor,
            &CancellationToken::new(),
            |_, _| Ok(()),
        )
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_first_failure_stops_new_work() {
        let parts = plan_by_count(100, 20).unwrap();
        let executor = |part: &Part| {
            if part.number == 2 {
                Err(TransferError::Transport("reset".to_string()))
            } else {
                thread::sleep(Duration::from_millis(2));
                ok_executor(part)
            }
        };
        let results = Mutex::new(0usize);
        let err = run(
            &parts,
            &HashSet::new(),
            2,
            &executor,
            &CancellationToken::new(),
            |_, _| {
                *results.lock().unwrap() += 1;
                Ok(())
            },
        )
        .unwrap_err();

        assert_eq!(err.part_number(), Some(2));
        // Only parts already in flight when part 2 failed were reported
        assert!(*results.lock().unwrap() < 20);
    }

    #[test]
    fn test_sequential_reports_failure() {
        let parts = plan_by_count(30, 3).unwrap();
        let executor = |part: &Part| {
            if part.number == 3 {
                Err(TransferError::Transport("boom".to_string()))
            } else {
                ok_executor(part)
            }
        };
        let mut reported = Vec::new();
        let err = run(
            &parts,
            &HashSet::new(),
            1,
            &executor,
            &CancellationToken::new(),
            |part, result| {
                reported.push((part.number, result.is_ok()));
                Ok(())
            },
        )
        .unwrap_err();
        assert_eq!(err.part_number(), Some(3));
        assert_eq!(reported, vec![(1, true), (2, true), (3, false)]);
    }

    #[test]
    fn test_panic_becomes_worker_error() {
        let parts = plan_by_count(10, 2).unwrap();
        let executor = |part: &Part| -> Result<PartOutcome> {
            if part.number == 1 {
                panic!("injected");
            }
            ok_executor(part)
        };
        let err = run(
            &parts,
            &HashSet::new(),
            2,
            &executor,
            &CancellationToken::new(),
            |_, _| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err.root_cause(), TransferError::Worker(_)));
    }

    #[test]
    fn test_cancellation_before_start() {
        let parts = plan_by_count(10, 5).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err =
            run(&parts, &HashSet::new(), 3, &ok_executor, &cancel, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[test]
    fn test_callback_error_aborts_run() {
        let parts = plan_by_count(10, 5).unwrap();
        let err = run(
            &parts,
            &HashSet::new(),
            2,
            &ok_executor,
            &CancellationToken::new(),
            |_, _| Err(TransferError::Checkpoint("disk full".to_string())),
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Checkpoint(_)));
    }
}
