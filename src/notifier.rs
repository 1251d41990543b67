// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Quiet-hours-gated push notifications, latched once per recording. See `SPEC_FULL.md` §4.12.
//!
//! Owned directly by [`crate::recorder`]'s actor state, the same way [`crate::preroll`] is: no
//! separate task, just a plain struct the recorder calls into on its own events. The one
//! fan-out point is the `broadcast::Sender` used by `/notifyws` listeners.

use serde::Serialize;
use store::detections::Detections;
use tokio::sync::broadcast;

const NOTIFY_CONFIDENCE_THRESHOLD: f32 = 0.9;
const NOTIFY_QUEUE_DEPTH: usize = 16;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    pub time: String,
    pub identifier: String,
    pub class: String,
    pub confidence: f32,
}

pub struct Notifier {
    current: Option<store::Record>,
    notified: bool,
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(NOTIFY_QUEUE_DEPTH);
        Notifier {
            current: None,
            notified: false,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn start_recording(&mut self, record: &store::Record) {
        self.current = Some(record.clone());
        self.notified = false;
    }

    /// Evaluates the gate from `SPEC_FULL.md` §4.12 (active, not yet notified, confident enough,
    /// inside the configured hour window) and broadcasts at most one notification per recording.
    pub fn motion_classified(&mut self, detections: &Detections, hours_start: u8, hours_end: u8) {
        if self.notified {
            return;
        }
        let Some(record) = self.current.clone() else {
            return;
        };
        let Some((class, confidence)) = detections.top() else {
            return;
        };
        if confidence < NOTIFY_CONFIDENCE_THRESHOLD {
            return;
        }
        let hour = base::time::local_hour(record.triggered_at);
        if !in_window(hour, hours_start, hours_end) {
            return;
        }
        let notification = Notification {
            time: base::time::format_clock12(record.triggered_at),
            identifier: record.identifier,
            class,
            confidence,
        };
        let _ = self.tx.send(notification);
        self.notified = true;
    }

    pub fn stop_recording(&mut self) {
        self.current = None;
        self.notified = false;
    }
}

/// `[start, end)`, wrapping across midnight when `start > end` (e.g. 22..6 covers overnight).
fn in_window(hour: u8, start: u8, end: u8) -> bool {
    if start == end {
        return false; // a zero-width window never matches any hour.
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn record_at(hour_offset_secs: u64) -> store::Record {
        store::Record {
            identifier: "20260101-000000+0000".to_string(),
            triggered_at: SystemTime::UNIX_EPOCH + Duration::from_secs(hour_offset_secs * 3600),
            have_video: false,
            have_thumb: false,
            have_vthumb: false,
            video_duration_sec: 0.0,
            size_bytes: 0,
            classification: Detections::default(),
        }
    }

    #[test]
    fn daytime_window_accepts_noon() {
        assert!(in_window(12, 6, 20));
        assert!(!in_window(22, 6, 20));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        assert!(in_window(23, 22, 6));
        assert!(in_window(2, 22, 6));
        assert!(!in_window(12, 22, 6));
    }

    #[test]
    fn zero_width_window_never_matches() {
        for hour in 0..24 {
            assert!(!in_window(hour, 9, 9));
        }
    }

    #[test]
    fn notifies_once_per_recording_above_threshold() {
        let mut n = Notifier::new();
        let mut rx = n.subscribe();
        let record = record_at(12); // noon UTC
        n.start_recording(&record);
        n.motion_classified(&Detections::single("person", 0.95), 6, 20);
        assert!(rx.try_recv().is_ok());
        // a second classification doesn't re-notify.
        n.motion_classified(&Detections::single("car", 0.99), 6, 20);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn low_confidence_does_not_notify() {
        let mut n = Notifier::new();
        let mut rx = n.subscribe();
        n.start_recording(&record_at(12));
        n.motion_classified(&Detections::single("person", 0.5), 6, 20);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outside_hour_window_does_not_notify() {
        let mut n = Notifier::new();
        let mut rx = n.subscribe();
        n.start_recording(&record_at(23));
        n.motion_classified(&Detections::single("person", 0.95), 6, 20);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_recording_resets_state_for_next_clip() {
        let mut n = Notifier::new();
        let mut rx = n.subscribe();
        n.start_recording(&record_at(12));
        n.motion_classified(&Detections::single("person", 0.95), 6, 20);
        assert!(rx.try_recv().is_ok());
        n.stop_recording();
        n.start_recording(&record_at(12));
        n.motion_classified(&Detections::single("dog", 0.95), 6, 20);
        assert!(rx.try_recv().is_ok());
    }
}
