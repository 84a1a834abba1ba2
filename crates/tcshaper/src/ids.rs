//! Identifier derivation and allocation
//!
//! Handles in the queueing hierarchy are `major:minor` pairs. The major id
//! for a device is derived deterministically from its name so repeated
//! invocations agree on the hierarchy without shared state; minor ids and
//! firewall marks are first-gap allocated against the live set scanned
//! immediately before use (the backend mutates ids outside this process,
//! so a cached allocation is a correctness bug, not an optimization miss).

use std::collections::BTreeSet;
use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::error::{Result, ShaperError};

/// Namespace tag for the outbound qdisc major id.
const OUTBOUND_TAG: u32 = 0x1000;
/// Namespace tag for the netem qdisc major id derived from the same device.
const NETEM_TAG: u32 = 0x2000;

/// Minor ids live in the 16-bit half of a handle.
const CLASS_MINOR_CAP: u32 = 0xFFFF;
/// Firewall marks are full 32-bit values, shared system-wide.
const MARK_CAP: u32 = u32::MAX;

fn device_hash(device: &str) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(device.as_bytes());
    // FxHash mixes by multiplication, which only carries entropy upward,
    // so the low bits of similar names coincide. Truncate from the top.
    (hasher.finish() >> 52) as u32
}

/// Deterministic major id for the outbound hierarchy of a device.
///
/// The hash is truncated to 12 bits, so two devices whose names collide
/// under the truncation will fight over the same major id. Known
/// limitation, accepted: a 4-hex-digit handle keeps diagnostics readable
/// and the tag digit guarantees the outbound and netem namespaces never
/// overlap for one device.
pub fn device_major_id(device: &str) -> u32 {
    OUTBOUND_TAG | device_hash(device)
}

/// Deterministic major id for the netem qdisc attached under the outbound
/// hierarchy of a device. Shares the hash with [`device_major_id`] but
/// lives in a disjoint tag namespace.
pub fn netem_major_id(device: &str) -> u32 {
    NETEM_TAG | device_hash(device)
}

fn first_gap(live: &BTreeSet<u32>, cap: u32, space: &'static str) -> Result<u32> {
    for candidate in 1..=cap {
        if !live.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ShaperError::IdSpaceExhausted(space))
}

/// Smallest class minor id >= 1 not present in the live set.
pub fn next_class_minor_id(live: &BTreeSet<u32>) -> Result<u32> {
    first_gap(live, CLASS_MINOR_CAP, "class minor id")
}

/// Smallest firewall mark >= 1 not present in the live set. Marks are
/// allocated globally because the mangle table is shared system-wide.
pub fn next_mark_id(live: &BTreeSet<u32>) -> Result<u32> {
    first_gap(live, MARK_CAP, "firewall mark")
}

/// Split a `major:minor` handle into its numeric halves. The minor half
/// may be empty (`"1f87:"` is the bare qdisc handle).
pub fn split_handle(handle: &str) -> Option<(u32, Option<u32>)> {
    let (major, minor) = handle.split_once(':')?;
    let major = u32::from_str_radix(major, 16).ok()?;
    if minor.is_empty() {
        return Some((major, None));
    }
    let minor = u32::from_str_radix(minor, 16).ok()?;
    Some((major, Some(minor)))
}
