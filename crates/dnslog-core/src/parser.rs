//! Line parser for the DNS server's audit log.
//!
//! Two line grammars are recognised, tried in this order:
//!
//! ```text
//! [2025-11-21 05:33:18,910] 10.1.102.201 query v2ray.com, type 1, time 63ms, speed: 29.4ms, group office, result 172.67.149.148
//! [2025-11-21 05:33:18,910] 10.1.102.201 query v2ray.com, type 1, time 63ms, speed: 29.4ms, result 172.67.149.148
//! ```
//!
//! A line matching neither grammar is not an error: the server writes other
//! noise to the same file and those lines are simply skipped. Numeric fields
//! are parsed leniently and fall back to zero, so a garbled number does not
//! throw away the client, domain and answer data of an otherwise good line.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::{Captures, Regex};

use crate::record::{QueryLogRecord, result_count};

/// Extended grammar, with the `group` field.
static EXTENDED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[(?P<ts>[^\]]+)\]\s+(?P<client>\S+)\s+query\s+(?P<domain>\S+?),\s+type\s+(?P<qtype>[^,]*),\s+time\s+(?P<time>[^,]*?)ms,\s+speed:\s+(?P<speed>[^,]*?)ms,\s+group\s+(?P<group>[^,]*),\s+result(?:\s+(?P<result>.*))?$",
    )
    .expect("extended line pattern is valid")
});

/// Legacy grammar, without the `group` field.
static LEGACY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[(?P<ts>[^\]]+)\]\s+(?P<client>\S+)\s+query\s+(?P<domain>\S+?),\s+type\s+(?P<qtype>[^,]*),\s+time\s+(?P<time>[^,]*?)ms,\s+speed:\s+(?P<speed>[^,]*?)ms,\s+result(?:\s+(?P<result>.*))?$",
    )
    .expect("legacy line pattern is valid")
});

/// Millisecond timestamp format (`2025-11-21 05:33:18,910`).
const TIMESTAMP_MILLIS: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Whole-second timestamp format (`2025-11-21 05:33:18`).
const TIMESTAMP_SECONDS: &str = "%Y-%m-%d %H:%M:%S";

/// Parse one log line into a record for `node_id`.
///
/// Leading and trailing whitespace is ignored. Returns `None` for lines that
/// match neither grammar or whose timestamp cannot be read.
pub fn parse_line(line: &str, node_id: u32) -> Option<QueryLogRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(caps) = EXTENDED_LINE.captures(line) {
        let group = caps.name("group").map(|m| m.as_str().trim().to_string());
        return build_record(&caps, line, node_id, group);
    }

    if let Some(caps) = LEGACY_LINE.captures(line) {
        return build_record(&caps, line, node_id, None);
    }

    None
}

fn build_record(
    caps: &Captures<'_>,
    line: &str,
    node_id: u32,
    group: Option<String>,
) -> Option<QueryLogRecord> {
    let timestamp = parse_timestamp(&caps["ts"])?;
    let result_ips = parse_result_ips(caps.name("result").map_or("", |m| m.as_str()));

    Some(QueryLogRecord {
        timestamp,
        node_id,
        client_ip: caps["client"].to_string(),
        domain: caps["domain"].to_string(),
        query_type: lenient(&caps["qtype"]),
        time_ms: lenient(&caps["time"]),
        speed_ms: lenient(&caps["speed"]),
        result_count: result_count(&result_ips),
        result_ips,
        group,
        raw_log: line.to_string(),
    })
}

/// Parse a log timestamp, trying millisecond precision first.
///
/// The log carries no zone information; values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_MILLIS)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, TIMESTAMP_SECONDS))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Split the comma-separated answer list. Empty input gives an empty list.
pub fn parse_result_ips(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }

    raw.split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .collect()
}

fn lenient<T: FromStr + Default>(raw: &str) -> T {
    raw.trim().parse().unwrap_or_default()
}
