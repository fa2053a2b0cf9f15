//! Object-table recovery.
//!
//! [`layout`] enumerates the record shapes seen across container builds;
//! [`scanner`] finds the table and picks the shape by scoring.

pub mod layout;
pub mod scanner;

pub use layout::{ObjectRecord, RecordLayout, RecordOverflow, RecordTail};
pub use scanner::{recover, scan_report, Candidate, ObjectTable, RecoveryError, ScanConfig, ScanReport};
