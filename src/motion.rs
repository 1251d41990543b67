// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Motion detection and the classifier color-sanity gate. See `SPEC_FULL.md` §4.6.
//!
//! There is no OpenCV binding in this crate's dependency stack, so the MOG2 background
//! subtractor the original system used is approximated here with a single adaptive Gaussian per
//! pixel (running mean + variance, exponentially updated) — the same "is this pixel an outlier
//! against its recent history" judgment MOG2 makes, without the multi-mode mixture. See
//! `DESIGN.md` for the full justification.

use crate::classifier::Classifier;
use crate::config::MotionConfig;
use crate::frame::Frame;
use crate::mjpeg;
use crate::sink::Sink;
use base::Error;
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::morphology::{dilate, erode};
use imageproc::point::Point;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rate limit on full analysis steps, independent of the capture frame rate.
pub const ANALYSIS_FPS: f64 = 1.0;

/// No motion is ever reported during this window after construction — gives the background model
/// time to converge instead of firing on the very first (cold) frame.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const BLEND_ALPHA: f32 = 0.38;
const MOG2_HISTORY_STEPS: f64 = 60.0;
const DILATE_RADIUS: u8 = 15; // ~30px ellipse diameter, approximated with an L2 disc.

pub enum Event {
    MotionDetected,
    MotionClassified(crate::classifier::Detections),
}

struct Background {
    mean: Vec<f32>,
    var: Vec<f32>,
    width: u32,
    height: u32,
}

impl Background {
    fn new(width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Background {
            mean: vec![0.0; n],
            var: vec![1024.0; n],
            width,
            height,
        }
    }

    /// Updates the running mean/variance with one new grayscale frame and returns a binary mask
    /// (255 = foreground) of pixels whose deviation from the mean exceeds `thresh` standard
    /// deviations' worth of variance.
    fn update(&mut self, frame: &GrayImage, thresh: f32) -> GrayImage {
        let alpha = 1.0 / MOG2_HISTORY_STEPS;
        let mut mask = ImageBuffer::new(self.width, self.height);
        for (i, px) in frame.pixels().enumerate() {
            let v = px.0[0] as f32;
            let mean = self.mean[i];
            let diff = v - mean;
            self.mean[i] += alpha * diff;
            self.var[i] = (1.0 - alpha) * self.var[i] + alpha * diff * diff;
            let std_dev = self.var[i].sqrt().max(1.0);
            let is_fg = diff.abs() > thresh.max(std_dev);
            let (x, y) = (i as u32 % self.width, i as u32 / self.width);
            mask.put_pixel(x, y, Luma([if is_fg { 255u8 } else { 0u8 }]));
        }
        mask
    }
}

/// A private scratch arena owned by the analyzer: no cross-task aliasing, every step reuses the
/// same buffers in sequence (see `SPEC_FULL.md` §9, "Shared scratch buffers in Motion").
pub struct MotionAnalyzer {
    background: Option<Background>,
    blended: Option<RgbImage>,
    classifier: Arc<Classifier>,
    mjpeg: mjpeg::Handle,
    created_at: Instant,
    last_step: Option<Instant>,
}

impl MotionAnalyzer {
    /// Shares `classifier` with [`crate::recorder`], which toggles it enabled/disabled around
    /// each recording; this analyzer only ever reads it.
    pub fn new(classifier: Arc<Classifier>, mjpeg: mjpeg::Handle) -> Self {
        MotionAnalyzer {
            background: None,
            blended: None,
            classifier,
            mjpeg,
            created_at: Instant::now(),
            last_step: None,
        }
    }

    /// Submits one frame for analysis. Rate-limited to `ANALYSIS_FPS`; calls arriving faster than
    /// that are dropped (the "double-buffered, drop-newest under load" design in §5).
    pub fn process(&mut self, frame: &Frame, config: &MotionConfig) -> Result<Vec<Event>, Error> {
        let now = Instant::now();
        if let Some(last) = self.last_step {
            if now.duration_since(last) < Duration::from_secs_f64(1.0 / ANALYSIS_FPS) {
                return Ok(Vec::new());
            }
        }
        self.last_step = Some(now);

        let mut events = Vec::new();
        let rgb = frame_to_rgb(frame);

        let blended = match self.blended.take() {
            Some(prev) => blend(&prev, &rgb, BLEND_ALPHA),
            None => rgb.clone(),
        };
        self.blended = Some(blended.clone());

        let masked = apply_roi_mask(&blended, &config.bounds);
        let gray = image::imageops::grayscale(&masked);

        let bg = self
            .background
            .get_or_insert_with(|| Background::new(gray.width(), gray.height()));
        let fg_mask = bg.update(&gray, config.thresh);

        let eroded = erode(&fg_mask, Norm::LInf, config.erode.max(1) as u8);
        let dilated = dilate(&eroded, Norm::L2, DILATE_RADIUS);

        self.mjpeg.debug_tap("motion-mask", &dilated);

        let contours = find_contours::<i32>(&dilated);
        let has_motion = contours
            .iter()
            .any(|c| c.border_type == BorderType::Outer && c.points.len() >= 3);

        if now.duration_since(self.created_at) >= STARTUP_TIMEOUT && has_motion {
            events.push(Event::MotionDetected);
        }

        if self.classifier.is_enabled() {
            let detections = self.classifier.classify(&rgb)?;
            if !detections.is_empty() && color_sanity_gate(&rgb) {
                events.push(Event::MotionClassified(detections));
            }
        }

        Ok(events)
    }
}

pub(crate) fn frame_to_rgb(frame: &Frame) -> RgbImage {
    let mut img = ImageBuffer::new(frame.width(), frame.height());
    let stride = frame.stride();
    let pixels = frame.pixels();
    for y in 0..frame.height() {
        let row = &pixels[y as usize * stride..][..stride];
        for x in 0..frame.width() {
            let px = &row[x as usize * 3..][..3];
            // Capture/encoder wire format is packed BGR (see `crate::frame`).
            img.put_pixel(x, y, Rgb([px[2], px[1], px[0]]));
        }
    }
    img
}

fn blend(prev: &RgbImage, new: &RgbImage, alpha: f32) -> RgbImage {
    ImageBuffer::from_fn(new.width(), new.height(), |x, y| {
        let p = prev.get_pixel(x, y).0;
        let n = new.get_pixel(x, y).0;
        Rgb([
            (alpha * n[0] as f32 + (1.0 - alpha) * p[0] as f32) as u8,
            (alpha * n[1] as f32 + (1.0 - alpha) * p[1] as f32) as u8,
            (alpha * n[2] as f32 + (1.0 - alpha) * p[2] as f32) as u8,
        ])
    })
}

/// Zeroes every pixel outside the configured polygon ROI (an approximation of "mask, then crop to
/// the bounding rect" — cropping is skipped since the scratch buffers are already sized to the
/// analysis resolution, and zeroed borders don't themselves trigger background-subtraction noise
/// because they're constant).
fn apply_roi_mask(img: &RgbImage, bounds: &[(i32, i32)]) -> RgbImage {
    if bounds.len() < 3 {
        return img.clone();
    }
    let mut mask: GrayImage = ImageBuffer::new(img.width(), img.height());
    let points: Vec<Point<i32>> = bounds.iter().map(|&(x, y)| Point::new(x, y)).collect();
    draw_polygon_mut(&mut mask, &points, Luma([255u8]));
    fill_polygon_interior(&mut mask, &points);
    ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
        if mask.get_pixel(x, y).0[0] > 0 {
            *img.get_pixel(x, y)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Simple even-odd scanline fill of the polygon outline already drawn into `mask`.
fn fill_polygon_interior(mask: &mut GrayImage, points: &[Point<i32>]) {
    let (w, h) = (mask.width() as i32, mask.height() as i32);
    for y in 0..h {
        let mut crossings: Vec<i32> = Vec::new();
        for i in 0..points.len() {
            let a = points[i];
            let b = points[(i + 1) % points.len()];
            if (a.y <= y && b.y > y) || (b.y <= y && a.y > y) {
                let t = (y - a.y) as f32 / (b.y - a.y) as f32;
                crossings.push(a.x + ((b.x - a.x) as f32 * t) as i32);
            }
        }
        crossings.sort_unstable();
        for pair in crossings.chunks(2) {
            if let [start, end] = pair {
                for x in (*start).max(0)..(*end).min(w) {
                    mask.put_pixel(x as u32, y as u32, Luma([255u8]));
                }
            }
        }
    }
}

/// Refuses to classify near-grayscale frames (typically IR night vision): resize to 300x300,
/// blur, and require the max |R-B| across the frame to be at least 15.
fn color_sanity_gate(img: &RgbImage) -> bool {
    let small = image::imageops::resize(img, 300, 300, image::imageops::FilterType::Triangle);
    let blurred = image::imageops::blur(&small, 2.0);
    let max_diff = blurred
        .pixels()
        .map(|p| (p.0[0] as i16 - p.0[2] as i16).unsigned_abs())
        .max()
        .unwrap_or(0);
    max_diff >= 15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_sanity_gate_rejects_grayscale() {
        let img: RgbImage = ImageBuffer::from_pixel(300, 300, Rgb([128, 128, 128]));
        assert!(!color_sanity_gate(&img));
    }

    #[test]
    fn color_sanity_gate_accepts_saturated_color() {
        let img: RgbImage = ImageBuffer::from_pixel(300, 300, Rgb([220, 40, 10]));
        assert!(color_sanity_gate(&img));
    }

    #[test]
    fn background_update_flags_large_deviation_as_foreground() {
        let mut bg = Background::new(2, 2);
        let calm = ImageBuffer::from_pixel(2, 2, Luma([50u8]));
        for _ in 0..30 {
            bg.update(&calm, 20.0);
        }
        let spike = ImageBuffer::from_pixel(2, 2, Luma([250u8]));
        let mask = bg.update(&spike, 20.0);
        assert!(mask.pixels().all(|p| p.0[0] == 255));
    }
}
