/*!
 * Building blocks of a multipart transfer
 */

pub mod bandwidth;
pub mod checkpoint;
pub mod checksum;
pub mod chunker;
pub mod progress;
pub mod retry;
pub mod scheduler;
