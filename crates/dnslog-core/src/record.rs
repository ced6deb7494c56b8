//! Structured form of a single DNS query-log line.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Maximum value stored in [`QueryLogRecord::result_count`].
pub const MAX_RESULT_COUNT: usize = u8::MAX as usize;

/// One successfully parsed query-log line.
///
/// Records are built once by the parser and never mutated afterwards. The
/// `node_id` comes from agent configuration; every other field is taken from
/// the line itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryLogRecord {
    /// When the query was logged (millisecond precision, UTC).
    pub timestamp: DateTime<Utc>,

    /// Node that produced the line.
    pub node_id: u32,

    /// Client address as written in the log.
    pub client_ip: String,

    /// Queried domain.
    pub domain: String,

    /// DNS record type number (1 = A, 28 = AAAA, 65 = HTTPS).
    pub query_type: u16,

    /// Total resolution time in milliseconds.
    pub time_ms: u32,

    /// Speed-check latency in milliseconds. Negative means "not measured".
    pub speed_ms: f32,

    /// Addresses in the answer, in log order.
    pub result_ips: Vec<String>,

    /// Number of answer addresses, saturating at 255.
    pub result_count: u8,

    /// Server group, only present in the extended line format.
    pub group: Option<String>,

    /// The original line.
    pub raw_log: String,
}

impl QueryLogRecord {
    /// Partition day of the record.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Timestamp as milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Days since the Unix epoch, the on-disk encoding of a `Date` column.
    pub fn days_since_epoch(&self) -> u16 {
        let days = self.timestamp.timestamp().div_euclid(86_400);
        days.clamp(0, u16::MAX as i64) as u16
    }
}

/// Answer count for a result list, capped at [`MAX_RESULT_COUNT`].
pub fn result_count(ips: &[String]) -> u8 {
    ips.len().min(MAX_RESULT_COUNT) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record_at(ts: DateTime<Utc>) -> QueryLogRecord {
        QueryLogRecord {
            timestamp: ts,
            node_id: 1,
            client_ip: "10.0.0.1".to_string(),
            domain: "example.com".to_string(),
            query_type: 1,
            time_ms: 3,
            speed_ms: -1.0,
            result_ips: vec![],
            result_count: 0,
            group: None,
            raw_log: String::new(),
        }
    }

    #[test]
    fn date_truncates_to_day() {
        let ts = Utc.with_ymd_and_hms(2025, 11, 21, 23, 59, 59).unwrap();
        let record = record_at(ts);
        assert_eq!(record.date(), NaiveDate::from_ymd_opt(2025, 11, 21).unwrap());
    }

    #[test]
    fn days_since_epoch_matches_calendar() {
        let ts = Utc.with_ymd_and_hms(1970, 1, 2, 0, 0, 1).unwrap();
        assert_eq!(record_at(ts).days_since_epoch(), 1);

        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(record_at(ts).days_since_epoch(), 20089);
    }

    #[test]
    fn result_count_saturates() {
        let ips: Vec<String> = (0..300).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
        assert_eq!(result_count(&ips), 255);
        assert_eq!(result_count(&ips[..3]), 3);
        assert_eq!(result_count(&[]), 0);
    }
}
