// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Glues one [`store::Record`] to its on-disk artifacts: the live video encode, the still
//! thumbnail, and the (slower, best-effort) video thumbnail transcode. See `SPEC_FULL.md` §4.10.

use crate::encoder::{self, EncoderSink, EncoderSpec};
use crate::fps::FpsNormalizer;
use crate::frame::{Frame, FramePool};
use crate::sink::Sink;
use base::{err, Error};
use image::imageops::FilterType;
use store::detections::Detections;
use tracing::warn;

const THUMB_WIDTH: u32 = 320;
const THUMB_HEIGHT: u32 = 180;

/// One open recording's write path. `put`/`close` mirror [`Sink`], plus the two background
/// artifact jobs spawned at `open` (still thumbnail) and `close` (video thumbnail).
pub struct VideoSink {
    identifier: String,
    inner: FpsNormalizer<EncoderSink>,
    store: store::Handle,
    video_path: std::path::PathBuf,
}

impl VideoSink {
    /// Opens the encoder for a newly triggered recording and kicks off the still-thumbnail write
    /// in the background from `first_frame` (typically the pre-roll's most recent frame).
    pub fn open(
        store: store::Handle,
        record: &store::Record,
        pool: FramePool,
        width: u32,
        height: u32,
        fps: f64,
        pre_roll_seconds: u32,
        first_frame: Option<Frame>,
    ) -> Result<Self, Error> {
        let video_path = record.video_path(store.base_dir());
        let encoder = EncoderSink::new(EncoderSpec {
            path: video_path.clone(),
            width,
            height,
            fps,
            pre_roll_seconds,
        })?;
        let inner = FpsNormalizer::new(encoder, pool, fps);

        if let Some(frame) = first_frame {
            spawn_thumbnail(store.clone(), record.identifier.clone(), frame);
        }

        Ok(VideoSink {
            identifier: record.identifier.clone(),
            inner,
            store,
            video_path,
        })
    }

    /// Finishes the encode, persists final metadata, and kicks off the video-thumbnail transcode
    /// in the background. The encoder's child process exit and rename are blocking, so this runs
    /// on a blocking-pool thread; callers await it from the recorder's async actor loop.
    pub async fn close(self, detections: Detections) -> Result<(), Error> {
        let encoder = self.inner.into_inner();
        let video_path = self.video_path.clone();
        tokio::task::spawn_blocking(move || encoder.close())
            .await
            .map_err(|e| err!(Internal, msg("encoder close task panicked: {e}")))??;

        let duration_sec = {
            let video_path = video_path.clone();
            tokio::task::spawn_blocking(move || encoder::probe_duration_sec(&video_path))
                .await
                .map_err(|e| err!(Internal, msg("duration probe task panicked: {e}")))?
                .unwrap_or_else(|e| {
                    warn!(err = %e.chain(), "video duration probe failed, recording as 0");
                    0.0
                })
        };
        let size_bytes = std::fs::metadata(&video_path)
            .map(|m| m.len())
            .unwrap_or(0);

        self.store
            .video_closed(&self.identifier, duration_sec, size_bytes, detections)
            .await?;

        spawn_video_thumbnail(self.store, self.identifier, video_path);
        Ok(())
    }
}

impl Sink for VideoSink {
    fn put(&mut self, frame: Frame) -> Result<(), Error> {
        self.inner.put(frame)
    }
}

fn spawn_thumbnail(store: store::Handle, identifier: String, frame: Frame) {
    tokio::spawn(async move {
        let base_dir = store.base_dir().to_path_buf();
        let ident = identifier.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<u64, String> {
            let rgb = crate::motion::frame_to_rgb(&frame);
            let resized =
                image::imageops::resize(&rgb, THUMB_WIDTH, THUMB_HEIGHT, FilterType::Triangle);
            let path = store::thumb_path(&base_dir, &ident);
            let temp_path = store::temp_path(&path);
            resized.save(&temp_path).map_err(|e| e.to_string())?;
            std::fs::rename(&temp_path, &path).map_err(|e| e.to_string())?;
            Ok(std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0))
        })
        .await;
        match result {
            Ok(Ok(size_bytes)) => {
                if let Err(e) = store.thumb_closed(&identifier, size_bytes).await {
                    warn!(%identifier, err = %e.chain(), "recording still-thumbnail completion failed");
                }
            }
            Ok(Err(e)) => warn!(%identifier, %e, "still thumbnail write failed"),
            Err(e) => warn!(%identifier, %e, "still thumbnail task panicked"),
        }
    });
}

fn spawn_video_thumbnail(store: store::Handle, identifier: String, video_path: std::path::PathBuf) {
    let vthumb_path = store::vthumb_path(store.base_dir(), &identifier);
    tokio::spawn(async move {
        let result = {
            let vthumb_path = vthumb_path.clone();
            tokio::task::spawn_blocking(move || encoder::make_video_thumbnail(&video_path, &vthumb_path))
                .await
        };
        let outcome = match result {
            Ok(Ok(())) => std::fs::metadata(&vthumb_path).map(|m| m.len()).ok(),
            Ok(Err(e)) => {
                warn!(%identifier, err = %e.chain(), "video thumbnail transcode failed");
                None
            }
            Err(e) => {
                warn!(%identifier, %e, "video thumbnail task panicked");
                None
            }
        };
        if let Some(size_bytes) = outcome {
            if let Err(e) = store.vthumb_closed(&identifier, size_bytes).await {
                warn!(%identifier, err = %e.chain(), "recording video-thumbnail completion failed");
            }
        }
    });
}
