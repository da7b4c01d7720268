/*!
 * Partwise - resumable multipart object transfers
 *
 * Moves a single large object between a local file and an object service,
 * or between two objects of one service, by splitting it into parts that:
 * - run concurrently on a bounded worker pool
 * - are checkpointed to disk so a failed transfer resumes where it stopped
 * - share one token-bucket bandwidth budget
 * - are verified end to end with a combinable CRC-64/ECMA
 *
 * The remote side is any [`protocol::ObjectService`]; a directory-backed
 * [`backend::LocalObjectStore`] and an HTTP adapter are provided.
 */

pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod stats;
pub mod transfer;

// Re-export commonly used types
pub use backend::LocalObjectStore;
pub use config::{CheckpointConfig, LogConfig, PartSizing, TransferConfig};
pub use core::bandwidth::BandwidthLimiter;
pub use core::checksum::{crc64, crc64_combine};
pub use core::progress::{ProgressEvent, ProgressPublisher};
pub use core::scheduler::{CancellationToken, PartOutcome};
pub use error::{Result, TransferError};
pub use protocol::ObjectService;
pub use stats::TransferStats;
pub use transfer::{NoopHook, PartHook, TransferKind, TransferManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
