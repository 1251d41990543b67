// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The garbage-collector's selection law, split out as a pure function so it's trivial to test
//! against the "GC monotonicity" property without a real database.

use std::time::{Duration, SystemTime};

/// Returns the identifiers of records eligible for deletion.
///
/// `records` must already be sorted descending by `triggered_at` (as [`crate::Handle::list`]
/// returns them). A record is eligible when either:
///
/// - cumulative size, summed newest-first through this record, already exceeds
///   `max_size_bytes` (0 disables this branch — the newest records are always kept first), or
/// - `triggered_at` is older than `now - max_age` (`None` disables this branch).
pub fn select_for_deletion(
    records: &[crate::Record],
    max_size_bytes: u64,
    max_age: Option<Duration>,
    now: SystemTime,
) -> Vec<String> {
    let mut doomed = Vec::new();
    let mut cumulative: u64 = 0;
    for r in records {
        cumulative = cumulative.saturating_add(r.size_bytes);
        let size_eligible = max_size_bytes != 0 && cumulative > max_size_bytes;
        let age_eligible = max_age.is_some_and(|max_age| match now.duration_since(r.triggered_at)
        {
            Ok(age) => age > max_age,
            Err(_) => false, // triggered_at is in the future; never age-eligible.
        });
        if size_eligible || age_eligible {
            doomed.push(r.identifier.clone());
        }
    }
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identifier: &str, triggered_at: SystemTime, size_bytes: u64) -> Record {
        Record {
            identifier: identifier.to_owned(),
            triggered_at,
            have_video: true,
            have_thumb: true,
            have_vthumb: true,
            video_duration_sec: 10.0,
            size_bytes,
            classification: Default::default(),
        }
    }

    #[test]
    fn zero_cap_disables_size_branch() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let records = vec![
            record("b", t0 + Duration::from_secs(10), 1_000_000),
            record("a", t0, 1_000_000),
        ];
        let doomed = select_for_deletion(&records, 0, None, t0 + Duration::from_secs(20));
        assert!(doomed.is_empty());
    }

    #[test]
    fn size_cap_keeps_newest() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        // Three records of 4 bytes each, newest first; cap of 10 should keep the newest two
        // (cumulative 4, 8) and evict the third (cumulative 12 > 10).
        let records = vec![
            record("c", t0 + Duration::from_secs(20), 4),
            record("b", t0 + Duration::from_secs(10), 4),
            record("a", t0, 4),
        ];
        let doomed = select_for_deletion(&records, 10, None, t0 + Duration::from_secs(30));
        assert_eq!(doomed, vec!["a".to_owned()]);
    }

    #[test]
    fn no_cap_over_total_deletes_nothing() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let records = vec![
            record("b", t0 + Duration::from_secs(10), 4),
            record("a", t0, 4),
        ];
        let doomed = select_for_deletion(&records, 1_000, None, t0 + Duration::from_secs(20));
        assert!(doomed.is_empty());
    }

    #[test]
    fn age_cap_evicts_old_records() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let now = t0 + Duration::from_secs(3600);
        let records = vec![
            record("recent", now - Duration::from_secs(10), 4),
            record("old", t0, 4),
        ];
        let doomed = select_for_deletion(&records, 0, Some(Duration::from_secs(1800)), now);
        assert_eq!(doomed, vec!["old".to_owned()]);
    }

    #[test]
    fn monotonicity_never_deletes_newer_than_a_kept_non_size_eligible_record() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let records = vec![
            record("newest", t0 + Duration::from_secs(30), 3),
            record("middle", t0 + Duration::from_secs(20), 3),
            record("oldest", t0, 100),
        ];
        let doomed = select_for_deletion(&records, 5, None, t0 + Duration::from_secs(40));
        // cumulative after "newest" = 3 (kept), after "middle" = 6 > 5 (evicted), "oldest" also
        // evicted since cumulative only grows. No record newer than a kept, non-eligible record
        // is ever deleted.
        assert_eq!(doomed, vec!["middle".to_owned(), "oldest".to_owned()]);
    }
}
