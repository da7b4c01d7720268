/*!
 * Part planning: split a byte range into numbered, contiguous parts
 */

use crate::config::PartSizing;
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};

/// Maximum number of parts in one multipart session, numbered 1 to 10,000
pub const MAX_PARTS: u32 = 10_000;

/// Largest part size accepted (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// A contiguous byte range of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Part {
    /// 1-based part number
    pub number: u32,
    /// Offset of the first byte
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl Part {
    pub fn new(number: u32, offset: u64, size: u64) -> Self {
        Self {
            number,
            offset,
            size,
        }
    }

    /// Offset one past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Inclusive HTTP range header value, `None` for an empty part
    pub fn range_header(&self) -> Option<String> {
        if self.size == 0 {
            None
        } else {
            Some(format!("bytes={}-{}", self.offset, self.end() - 1))
        }
    }
}

/// Split `total_size` into exactly `count` parts.
///
/// Every part holds `total_size / count` bytes except the last, which also
/// absorbs the remainder.
pub fn plan_by_count(total_size: u64, count: u32) -> Result<Vec<Part>> {
    if count == 0 {
        return Err(TransferError::InvalidArgument(
            "part count must be positive".to_string(),
        ));
    }
    if count > MAX_PARTS {
        return Err(TransferError::InvalidArgument(format!(
            "part count {} exceeds the limit of {}",
            count, MAX_PARTS
        )));
    }
    if count as u64 > total_size {
        return Err(TransferError::InvalidArgument(format!(
            "cannot split {} bytes into {} parts",
            total_size, count
        )));
    }

    let base = total_size / count as u64;
    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i as u64 * base;
        let size = if i + 1 == count {
            total_size - offset
        } else {
            base
        };
        parts.push(Part::new(i + 1, offset, size));
    }
    Ok(parts)
}

/// Split `total_size` into `part_size` pieces plus one trailing remainder part.
pub fn plan_by_part_size(total_size: u64, part_size: u64) -> Result<Vec<Part>> {
    if part_size == 0 {
        return Err(TransferError::InvalidArgument(
            "part size must be positive".to_string(),
        ));
    }

    let full_parts = total_size / part_size;
    let remainder = total_size % part_size;
    let count = full_parts + u64::from(remainder != 0);
    if count > MAX_PARTS as u64 {
        return Err(TransferError::InvalidArgument(format!(
            "part size {} yields {} parts for {} bytes (limit {}); choose a larger part size",
            part_size, count, total_size, MAX_PARTS
        )));
    }

    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..full_parts {
        parts.push(Part::new(i as u32 + 1, i * part_size, part_size));
    }
    if remainder != 0 {
        parts.push(Part::new(
            full_parts as u32 + 1,
            full_parts * part_size,
            remainder,
        ));
    }
    Ok(parts)
}

/// Plan a transfer according to `sizing`.
///
/// A zero-length source becomes a single empty part so that it still goes
/// through the same session and finalize steps.
pub fn plan(total_size: u64, sizing: PartSizing) -> Result<Vec<Part>> {
    sizing.validate()?;
    if total_size == 0 {
        return Ok(vec![Part::new(1, 0, 0)]);
    }
    match sizing {
        PartSizing::Count(count) => plan_by_count(total_size, count),
        PartSizing::Size(part_size) => plan_by_part_size(total_size, part_size),
    }
}
