// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2020 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wall-clock formatting shared by the event store (record identifiers) and the notifier
//! (quiet-hours gating).

use std::time::SystemTime;

/// The time zone used for identifier formatting and quiet-hours hour extraction.
///
/// Assigned once from `jiff::tz::TimeZone::system()` at startup; tests pin it to a known
/// zone so identifier/hour math is reproducible across machines.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE
        .get()
        .cloned()
        .unwrap_or_else(jiff::tz::TimeZone::UTC)
}

fn to_zoned(t: SystemTime) -> jiff::Zoned {
    let ts = jiff::Timestamp::try_from(t).unwrap_or(jiff::Timestamp::UNIX_EPOCH);
    ts.to_zoned(global_zone())
}

/// Formats `t` as the record identifier: `YYYYMMDD-HHMMSSZZZZZ`, e.g. `20260726-143012-0700`.
///
/// Sortable lexicographically in the same order as `t`, and usable directly as a filename stem.
pub fn format_identifier(t: SystemTime) -> String {
    let z = to_zoned(t);
    let off = z.offset().seconds();
    let sign = if off < 0 { '-' } else { '+' };
    let off = off.unsigned_abs();
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}{}{:02}{:02}",
        z.year(),
        z.month(),
        z.day(),
        z.hour(),
        z.minute(),
        z.second(),
        sign,
        off / 3600,
        (off % 3600) / 60,
    )
}

/// Returns the local-time hour (0-23) of `t`, for quiet-hours gating.
pub fn local_hour(t: SystemTime) -> u8 {
    to_zoned(t).hour() as u8
}

/// Formats `t` as `H:MM AM/PM`, the notification payload's display time.
pub fn format_clock12(t: SystemTime) -> String {
    let z = to_zoned(t);
    let hour24 = z.hour();
    let (hour12, suffix) = match hour24 {
        0 => (12, "AM"),
        1..=11 => (hour24, "AM"),
        12 => (12, "PM"),
        _ => (hour24 - 12, "PM"),
    };
    format!("{}:{:02} {}", hour12, z.minute(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_utc() {
        init_zone(|| jiff::tz::TimeZone::UTC);
    }

    #[test]
    fn identifier_format_is_sortable() {
        init_utc();
        let t1 = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let t2 = t1 + std::time::Duration::from_secs(60);
        let i1 = format_identifier(t1);
        let i2 = format_identifier(t2);
        assert!(i1 < i2, "{i1} should sort before {i2}");
        assert_eq!(i1.len(), "20231114-221320+0000".len());
    }

    #[test]
    fn clock12_noon_and_midnight() {
        init_utc();
        // 1970-01-01T00:00:00Z
        assert_eq!(format_clock12(SystemTime::UNIX_EPOCH), "12:00 AM");
        // 1970-01-01T12:00:00Z
        let noon = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(12 * 3600);
        assert_eq!(format_clock12(noon), "12:00 PM");
    }
}
