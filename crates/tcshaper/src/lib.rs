//! Traffic shaping rule reconciliation over tc and iptables
//!
//! This library turns high-level shaping intent (limit a device or flow to
//! a bandwidth, delay, loss rate) into the backend command sequences that
//! realize it, and reads the live configuration back by parsing the
//! backend's diagnostic listings into structured rules.

pub mod backend;
pub mod container;
pub mod error;
pub mod finder;
pub mod ids;
pub mod parse;
pub mod selector;
pub mod shaper;
pub mod show;
pub mod store;
pub mod units;

pub use backend::{CommandOutput, ShapingBackend, TcBackend};
pub use error::{Result, ShaperError};
pub use selector::{Direction, Protocol, TrafficSelector};
pub use shaper::{ensure_device, RequestMode, Shaper, ShapingAlgorithm, ShapingRequest};
pub use show::{collect_rules, RuleSet};
