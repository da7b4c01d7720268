/*!
 * Summary of a finished transfer
 */

use crate::transfer::TransferKind;
use std::fmt;
use std::time::Duration;

/// Statistics about a completed transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStats {
    pub kind: TransferKind,
    /// Size of the transferred object
    pub total_bytes: u64,
    pub parts_total: usize,
    /// Parts moved by this invocation
    pub parts_transferred: usize,
    /// Parts already done by an earlier invocation
    pub parts_skipped: usize,
    /// Bytes moved by this invocation
    pub bytes_transferred: u64,
    pub duration: Duration,
    /// End-to-end CRC-64/ECMA, when known
    pub crc64: Option<u64>,
    /// ETag of the committed object (uploads and copies)
    pub etag: Option<String>,
    pub resumed: bool,
}

impl TransferStats {
    pub fn new(kind: TransferKind) -> Self {
        Self {
            kind,
            total_bytes: 0,
            parts_total: 0,
            parts_transferred: 0,
            parts_skipped: 0,
            bytes_transferred: 0,
            duration: Duration::ZERO,
            crc64: None,
            etag: None,
            resumed: false,
        }
    }

    /// Average throughput of this invocation in bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} complete", self.kind)?;
        writeln!(f, "  Size:        {}", format_bytes(self.total_bytes))?;
        write!(
            f,
            "  Parts:       {} total, {} transferred",
            self.parts_total, self.parts_transferred
        )?;
        if self.parts_skipped > 0 {
            write!(f, ", {} resumed", self.parts_skipped)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "  Duration:    {} ({}/s)",
            format_duration(self.duration.as_millis() as u64),
            format_bytes(self.throughput() as u64)
        )?;
        if let Some(crc) = self.crc64 {
            writeln!(f, "  CRC-64:      {}", crc)?;
        }
        if let Some(ref etag) = self.etag {
            writeln!(f, "  ETag:        {}", etag)?;
        }
        Ok(())
    }
}

/// Format bytes into human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let base = 1024.0_f64;
    let exp = (bytes_f.ln() / base.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    let value = bytes_f / base.powi(exp as i32);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.2} {}", value, UNITS[exp])
    }
}

/// Format duration into human-readable format
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        return format!("{}ms", ms);
    }

    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes % 60, seconds % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(500), "500ms");
        assert_eq!(format_duration(60000), "1m 0s");
        assert_eq!(format_duration(3661000), "1h 1m 1s");
    }

    #[test]
    fn test_display_mentions_resumed_parts() {
        let mut stats = TransferStats::new(TransferKind::Upload);
        stats.total_bytes = 2048;
        stats.parts_total = 4;
        stats.parts_transferred = 1;
        stats.parts_skipped = 3;
        stats.duration = Duration::from_millis(1500);
        stats.bytes_transferred = 512;
        let text = stats.to_string();
        assert!(text.starts_with("upload complete"));
        assert!(text.contains("3 resumed"));
        assert!(text.contains("2.00 KB"));
    }
}
