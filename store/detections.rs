// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A per-recording map from normalized class label to the maximum observed confidence.
//!
//! Merge is element-wise max, which makes it commutative, associative, and idempotent — see the
//! tests below. The serialized form is a `Vec<(String, f32)>` rather than a JSON object so that
//! ordering is under our control rather than `serde_json`'s map iteration order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Detections(BTreeMap<String, f32>);

impl Detections {
    pub fn single(class: impl Into<String>, confidence: f32) -> Self {
        let mut d = Detections::default();
        d.insert(class.into(), confidence);
        d
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Inserts `(class, confidence)`, keeping the higher confidence if `class` is already present.
    pub fn insert(&mut self, class: String, confidence: f32) {
        self.0
            .entry(class)
            .and_modify(|c| *c = c.max(confidence))
            .or_insert(confidence);
    }

    /// Merges `other` into `self`, element-wise max. Commutative, associative, idempotent.
    pub fn merge(&mut self, other: &Detections) {
        for (class, confidence) in &other.0 {
            self.insert(class.clone(), *confidence);
        }
    }

    /// Returns `(class, confidence)` pairs, descending by confidence, ties broken by class name.
    pub fn sorted(&self) -> Vec<(String, f32)> {
        let mut v: Vec<(String, f32)> = self.0.iter().map(|(c, p)| (c.clone(), *p)).collect();
        v.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        v
    }

    /// Returns the single highest-confidence detection, if any.
    pub fn top(&self) -> Option<(String, f32)> {
        self.sorted().into_iter().next()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.sorted()).expect("Vec<(String, f32)> always serializes")
    }

    pub fn from_json(s: &str) -> Option<Detections> {
        let pairs: Vec<(String, f32)> = serde_json::from_str(s).ok()?;
        let mut d = Detections::default();
        for (class, confidence) in pairs {
            d.insert(class, confidence);
        }
        Some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_elementwise_max() {
        let mut a = Detections::single("person", 0.6);
        a.insert("vehicle".into(), 0.3);
        let b = Detections::single("person", 0.9);
        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged.top(), Some(("person".to_owned(), 0.9)));
        assert_eq!(merged.sorted()[1], ("vehicle".to_owned(), 0.3));
    }

    #[test]
    fn merge_is_commutative_associative_idempotent() {
        let a = Detections::single("person", 0.6);
        let b = Detections::single("vehicle", 0.9);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.sorted(), ba.sorted(), "merge should be commutative");

        let mut a_ab = a.clone();
        a_ab.merge(&ab);
        assert_eq!(a_ab.sorted(), ab.sorted(), "merge(a, merge(a,b)) == merge(a,b)");

        let mut ab2 = ab.clone();
        ab2.merge(&ab);
        assert_eq!(ab2.sorted(), ab.sorted(), "merge should be idempotent");
    }

    #[test]
    fn sorted_breaks_ties_lexicographically() {
        let mut d = Detections::single("zebra", 0.5);
        d.insert("animal".into(), 0.5);
        assert_eq!(
            d.sorted(),
            vec![("animal".to_owned(), 0.5), ("zebra".to_owned(), 0.5)]
        );
    }

    #[test]
    fn json_roundtrip() {
        let mut d = Detections::single("person", 0.95);
        d.insert("vehicle".into(), 0.4);
        let json = d.to_json();
        let back = Detections::from_json(&json).unwrap();
        assert_eq!(back.sorted(), d.sorted());
    }

    #[test]
    fn empty_roundtrips() {
        let d = Detections::default();
        assert!(d.is_empty());
        assert_eq!(Detections::from_json(&d.to_json()).unwrap(), d);
    }
}
