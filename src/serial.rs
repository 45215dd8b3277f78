//! Zone serial numbers derived from the wall clock.
//!
//! A serial counts ten-second ticks since 1900 using fixed 12-month years and
//! 31-day months, so serials sort by time and fit comfortably in a u32.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Serial for the ten-second tick containing `t`.
pub fn serial_at(t: DateTime<Utc>) -> u32 {
    let years = (t.year() - 1900).max(0) as u32;
    let months = years * 12 + t.month0();
    let days = months * 31 + t.day0();
    let hours = days * 24 + t.hour();
    let minutes = hours * 60 + t.minute();
    minutes * 6 + t.second() / 10
}

/// Serial for the current tick.
pub fn current_serial() -> u32 {
    serial_at(Utc::now())
}

/// Serial to use for a new commit.
pub fn next_serial() -> u32 {
    current_serial().wrapping_add(1)
}
