//! Diagnostic text parsers
//!
//! The backend only exposes its live state as human-readable listings, so
//! reading it back means parsing text. Each parser here covers one listing
//! category and is deliberately tolerant: a line it does not recognize is
//! skipped, never an error, so a newer backend printing extra decorations
//! degrades to partial information instead of a crash.

mod class;
mod filter;
mod mangle;
mod qdisc;

pub use class::{parse_classes, ClassRecord};
pub use filter::{parse_filters, FilterRecord, FilterScan, MarkFilter, U32Filter};
pub use mangle::{parse_mangle, MangleChain, MangleRecord};
pub use qdisc::{parse_qdiscs, QdiscRecord};

/// True when a token looks like a time magnitude (`10.0ms`, `2us`), used
/// for the jitter lookahead after a delay value.
fn is_time_token(token: &str) -> bool {
    let starts_numeric = token.starts_with(|c: char| c.is_ascii_digit());
    starts_numeric && (token.ends_with("ms") || token.ends_with("us") || token.ends_with('s'))
}
