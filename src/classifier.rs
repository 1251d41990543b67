// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Single-shot ONNX object detector. See `SPEC_FULL.md` §4.7.
//!
//! Grounded on the `ort` 2.0 session API and on the post-processing shape of
//! `yonasBSD-privastead/motion_ai/pipeline`'s inference stage (native class id → remapped class,
//! confidence threshold, `class -> max confidence` output map).

use base::{err, Error};
use image::RgbImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
pub use store::detections::Detections;

const INPUT_SIZE: u32 = 300;
const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// MobileNet-SSD's native numeric class ids, remapped to the handful of classes this system
/// cares about. Ids not present here are dropped during post-processing.
fn remap_class(native_id: i64) -> Option<&'static str> {
    match native_id {
        15 => Some("person"),
        2 => Some("car"),
        8 => Some("cat"),
        12 => Some("dog"),
        _ => None,
    }
}

pub struct Classifier {
    session: Mutex<Session>,
    enabled: AtomicBool,
}

impl Classifier {
    pub fn load(model_path: &Path) -> Result<Self, Error> {
        let session = Session::builder()
            .map_err(|e| err!(BindError, msg("building ort session: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| err!(BindError, msg("setting ort optimization level: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| err!(BindError, msg("loading classifier model {model_path:?}: {e}")))?;
        Ok(Classifier {
            session: Mutex::new(session),
            enabled: AtomicBool::new(false),
        })
    }

    /// Enabled by the recorder on `start-recording`, disabled on `stop-recording`: classification
    /// only runs while a clip is actually being captured.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Runs the detector if enabled; returns an empty map immediately otherwise.
    pub fn classify(&self, frame: &RgbImage) -> Result<Detections, Error> {
        if !self.is_enabled() {
            return Ok(Detections::default());
        }
        let input = preprocess(frame);
        let mut session = self.session.lock().expect("classifier session mutex poisoned");
        let value = Value::from_array(input)
            .map_err(|e| err!(Internal, msg("building ort input tensor: {e}")))?;
        let outputs = session
            .run(ort::inputs![value])
            .map_err(|e| err!(Internal, msg("running classifier inference: {e}")))?;

        // MobileNet-SSD's conventional output layout: one [N, 7] detection tensor, rows
        // `[batch, class, confidence, x1, y1, x2, y2]` in normalized coordinates.
        let (shape, data) = outputs[0]
            .try_extract_raw_tensor::<f32>()
            .map_err(|e| err!(Internal, msg("extracting classifier output: {e}")))?;
        let row_len = *shape.last().unwrap_or(&7) as usize;
        let mut detections = Detections::default();
        for row in data.chunks(row_len.max(1)) {
            if row.len() < 3 {
                continue;
            }
            let native_class = row[1] as i64;
            let confidence = row[2];
            if confidence < CONFIDENCE_THRESHOLD {
                continue;
            }
            let Some(class) = remap_class(native_class) else {
                continue;
            };
            detections.insert(class.to_string(), confidence);
        }
        Ok(detections)
    }
}

/// Resizes to the detector's fixed input size and arranges into an NCHW f32 tensor normalized to
/// `[0, 1]`, the standard input contract for MobileNet-SSD ONNX exports.
fn preprocess(frame: &RgbImage) -> Array4<f32> {
    let resized = image::imageops::resize(
        frame,
        INPUT_SIZE,
        INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );
    Array4::from_shape_fn((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize), |(_, c, y, x)| {
        resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_keeps_known_classes_and_drops_unknown() {
        assert_eq!(remap_class(15), Some("person"));
        assert_eq!(remap_class(999), None);
    }

    #[test]
    fn preprocess_produces_expected_shape() {
        let img: RgbImage = image::ImageBuffer::from_pixel(64, 64, image::Rgb([10, 20, 30]));
        let tensor = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, 300, 300]);
        assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
