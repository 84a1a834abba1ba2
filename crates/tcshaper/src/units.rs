//! Human-readable magnitude parsing: bandwidth, time, percentage
//!
//! All parsers are pure functions over the input text. The only system
//! access in this module is the link-speed probe, which falls back to a
//! fixed upper bound instead of erroring because virtual interfaces
//! routinely have no readable speed attribute.

use std::fmt;
use std::path::Path;

use crate::error::{Result, ShaperError};

/// Upper bound substituted when the link speed attribute is unreadable.
pub const FALLBACK_LINK_SPEED_BPS: f64 = 32_000_000_000.0;

/// Maximum accepted time magnitude (60 minutes, in milliseconds).
const MAX_TIME_MSEC: f64 = 60.0 * 60_000.0;

/// Multiplier base for bandwidth unit prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KiloSize {
    K1000,
    K1024,
}

impl KiloSize {
    fn value(self) -> f64 {
        match self {
            Self::K1000 => 1000.0,
            Self::K1024 => 1024.0,
        }
    }
}

/// Split a magnitude string into its numeric value and unit suffix.
///
/// Accepts an optional leading sign, digits and an optional decimal point;
/// the unit starts at the first alphabetic (or `%`) character.
fn split_magnitude(text: &str) -> Result<(f64, &str)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ShaperError::parameter(text, "empty magnitude"));
    }

    let unit_start = trimmed
        .find(|c: char| c.is_ascii_alphabetic() || c == '%')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(unit_start);

    let value: f64 = number
        .parse()
        .map_err(|_| ShaperError::parameter(text, "leading token is not a number"))?;

    Ok((value, unit))
}

/// Parse a bandwidth magnitude into bits per second.
///
/// Unit suffixes are case-insensitive `{b,k,m,g,t}` optionally followed by
/// `bps` or `bit`. A missing unit is an error: a bare number is ambiguous
/// between bits and kilobits across tools, so we refuse to guess.
pub fn parse_bandwidth(text: &str, kilo: KiloSize) -> Result<f64> {
    let (value, unit) = split_magnitude(text)?;
    if unit.is_empty() {
        return Err(ShaperError::UnitNotFound(text.to_string()));
    }
    if value < 0.0 {
        return Err(ShaperError::parameter(text, "bandwidth must not be negative"));
    }

    let lower = unit.to_ascii_lowercase();
    let prefix = lower
        .strip_suffix("bps")
        .or_else(|| lower.strip_suffix("bit"))
        .unwrap_or(&lower);

    let exponent = match prefix {
        "" | "b" => 0,
        "k" => 1,
        "m" => 2,
        "g" => 3,
        "t" => 4,
        _ => return Err(ShaperError::UnitNotFound(text.to_string())),
    };

    Ok(value * kilo.value().powi(exponent))
}

/// Render a bit-per-second value with the largest unit that keeps the
/// number at or above one, trimming a trailing `.0`.
pub fn format_bandwidth(bps: f64) -> String {
    const UNITS: [&str; 5] = ["bps", "Kbps", "Mbps", "Gbps", "Tbps"];
    let mut value = bps;
    let mut index = 0;
    while value >= 1000.0 && index < UNITS.len() - 1 {
        value /= 1000.0;
        index += 1;
    }
    if value.fract() == 0.0 {
        format!("{}{}", value as u64, UNITS[index])
    } else {
        format!("{:.2}{}", value, UNITS[index])
    }
}

/// Render a bit-per-second value in the unit grammar the backend accepts
/// (`bit`/`Kbit`/`Mbit`/`Gbit`).
pub fn format_backend_rate(bps: f64) -> String {
    const UNITS: [&str; 4] = ["bit", "Kbit", "Mbit", "Gbit"];
    let mut value = bps;
    let mut index = 0;
    while value >= 1000.0 && index < UNITS.len() - 1 {
        value /= 1000.0;
        index += 1;
    }
    if value.fract() == 0.0 {
        format!("{}{}", value as u64, UNITS[index])
    } else {
        format!("{:.3}{}", value, UNITS[index])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
}

impl TimeUnit {
    fn canonical(self) -> &'static str {
        match self {
            Self::Microseconds => "usec",
            Self::Milliseconds => "ms",
            Self::Seconds => "sec",
            Self::Minutes => "min",
        }
    }

    fn msec_factor(self) -> f64 {
        match self {
            Self::Microseconds => 0.001,
            Self::Milliseconds => 1.0,
            Self::Seconds => 1000.0,
            Self::Minutes => 60_000.0,
        }
    }
}

/// A parsed time magnitude. Keeps the unit it was written in so rendering
/// can stay close to what the user typed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeValue {
    value: f64,
    unit: TimeUnit,
}

impl TimeValue {
    pub fn as_msec(&self) -> f64 {
        self.value * self.unit.msec_factor()
    }

    pub fn as_seconds(&self) -> f64 {
        self.as_msec() / 1000.0
    }
}

impl fmt::Display for TimeValue {
    /// Canonical rendering: an integral value keeps its unit with the
    /// canonical spelling (`1s` -> `1sec`); a fractional value is converted
    /// to seconds with six decimals (`0.1m` -> `6.000000sec`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.fract() == 0.0 {
            write!(f, "{}{}", self.value as u64, self.unit.canonical())
        } else {
            write!(f, "{:.6}sec", self.as_seconds())
        }
    }
}

/// Parse a time magnitude. A missing unit means milliseconds; the accepted
/// range is 0ms through 60min inclusive.
pub fn parse_time(text: &str) -> Result<TimeValue> {
    let (value, unit_str) = split_magnitude(text)?;

    let unit = match unit_str.to_ascii_lowercase().as_str() {
        "" | "ms" | "msec" => TimeUnit::Milliseconds,
        "us" | "usec" => TimeUnit::Microseconds,
        "s" | "sec" => TimeUnit::Seconds,
        "m" | "min" => TimeUnit::Minutes,
        _ => return Err(ShaperError::UnitNotFound(text.to_string())),
    };

    let parsed = TimeValue { value, unit };
    if value < 0.0 || parsed.as_msec() > MAX_TIME_MSEC {
        return Err(ShaperError::parameter(
            text,
            "value out of range (0ms through 60min)",
        ));
    }

    Ok(parsed)
}

/// Parse a percentage with an optional `%` suffix, inclusive range
/// `[0, max]`. `max` lets call sites cap individual impairments below 100.
pub fn parse_percent(text: &str, max: f64) -> Result<f64> {
    let (value, unit) = split_magnitude(text)?;
    match unit {
        "" | "%" => (),
        _ => return Err(ShaperError::UnitNotFound(text.to_string())),
    }
    if value < 0.0 || value > max {
        return Err(ShaperError::parameter(
            text,
            format!("value out of range (0 through {})", max),
        ));
    }
    Ok(value)
}

/// Read the link speed of a device in bits per second.
///
/// The speed attribute reports Mbps and is absent or `-1` on virtual
/// interfaces, so any failure falls back to [`FALLBACK_LINK_SPEED_BPS`].
pub fn link_speed_bps(device: &str) -> f64 {
    let path = Path::new("/sys/class/net").join(device).join("speed");
    match std::fs::read_to_string(&path) {
        Ok(text) => match text.trim().parse::<i64>() {
            Ok(mbps) if mbps > 0 => mbps as f64 * 1_000_000.0,
            _ => FALLBACK_LINK_SPEED_BPS,
        },
        Err(_) => FALLBACK_LINK_SPEED_BPS,
    }
}
