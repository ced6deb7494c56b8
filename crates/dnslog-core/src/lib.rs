//! Core types and shared utilities for the dnslog ingestion agent.
//!
//! This crate provides:
//! - [`QueryLogRecord`], the structured form of one DNS query-log line
//! - The line parser for the legacy and extended audit-log grammars
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
pub mod parser;
mod record;

pub use error::{Error, Result};
pub use parser::{parse_line, parse_result_ips, parse_timestamp};
pub use record::{MAX_RESULT_COUNT, QueryLogRecord, result_count};
