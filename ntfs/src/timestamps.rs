// NTFS FILETIME handling (100ns ticks since 1601-01-01 UTC) and the
// reentrant transaction marker that stamps metadata changes

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between 1601-01-01 and the Unix epoch
const WINDOWS_EPOCH_DIFF: i64 = 11_644_473_600;

const FILETIME_TICKS_PER_SECOND: i64 = 10_000_000;

pub fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let seconds = time.timestamp() + WINDOWS_EPOCH_DIFF;
    if seconds < 0 {
        return 0;
    }
    (seconds * FILETIME_TICKS_PER_SECOND + time.timestamp_subsec_nanos() as i64 / 100) as u64
}

pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let ticks = i64::try_from(filetime).ok()?;
    let seconds = ticks / FILETIME_TICKS_PER_SECOND - WINDOWS_EPOCH_DIFF;
    let nanos = (ticks % FILETIME_TICKS_PER_SECOND) * 100;
    Utc.timestamp_opt(seconds, nanos as u32).single()
}

pub fn current_filetime() -> u64 {
    datetime_to_filetime(Utc::now())
}

/// Nesting counter that pins one timestamp for a whole call tree.
///
/// This is not a journal: nothing is logged and nothing can be rolled back.
#[derive(Debug, Default)]
pub struct TransactionMarker {
    depth: u32,
    timestamp: Option<u64>,
}

impl TransactionMarker {
    /// Enter a (possibly nested) transaction and return its timestamp.
    pub fn begin(&mut self) -> u64 {
        self.depth += 1;
        *self.timestamp.get_or_insert_with(current_filetime)
    }

    pub fn end(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.timestamp = None;
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Timestamp of the open transaction, or the current time outside one.
    pub fn now(&self) -> u64 {
        self.timestamp.unwrap_or_else(current_filetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_epochs() {
        let unix_epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(datetime_to_filetime(unix_epoch), 116_444_736_000_000_000);
        assert_eq!(filetime_to_datetime(116_444_736_000_000_000), Some(unix_epoch));

        let t = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap();
        assert_eq!(filetime_to_datetime(datetime_to_filetime(t)), Some(t));
    }

    #[test]
    fn test_nested_transactions_share_timestamp() {
        let mut marker = TransactionMarker::default();
        let outer = marker.begin();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let inner = marker.begin();
        assert_eq!(outer, inner);
        assert_eq!(marker.depth(), 2);
        marker.end();
        assert_eq!(marker.now(), outer);
        marker.end();
        assert_eq!(marker.depth(), 0);
        marker.end();
        assert_eq!(marker.depth(), 0);
    }
}
