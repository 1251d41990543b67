// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The MJPEG hub: named live streams, fanned out to multiple HTTP clients, each with its own
//! resize/quality/FPS cap. See `SPEC_FULL.md` §4.8.

use bytes::Bytes;
use image::{DynamicImage, GrayImage, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

const BOUNDARY: &str = "MJPEGBOUNDARY";
/// Per-client outbound queue depth. Small and non-blocking: a slow client should drop frames, not
/// build an unbounded backlog.
const CLIENT_QUEUE_DEPTH: usize = 2;
const COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct SessionOpts {
    pub resize: Option<(u32, u32)>,
    pub quality: u8,
    pub max_fps: Option<f64>,
}

impl Default for SessionOpts {
    fn default() -> Self {
        SessionOpts {
            resize: None,
            quality: 80,
            max_fps: None,
        }
    }
}

struct ClientSession {
    opts: SessionOpts,
    last_sent: Option<Instant>,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct StreamState {
    clients: Vec<ClientSession>,
}

enum Command {
    Put { name: String, image: Arc<DynamicImage> },
    Subscribe {
        name: String,
        opts: SessionOpts,
        respond: oneshot::Sender<mpsc::Receiver<Bytes>>,
    },
}

/// Cheap-clone handle to the single process-wide hub actor.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<Command>,
}

pub fn spawn() -> Handle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    tokio::spawn(run(rx));
    Handle { tx }
}

impl Handle {
    pub fn put_rgb(&self, name: &str, image: &RgbImage) {
        self.put(name, DynamicImage::ImageRgb8(image.clone()));
    }

    /// The "stream pool" convenience facade used by [`crate::motion`]: lazily creates a named
    /// debug stream on first write, a no-op until some client actually subscribes to it.
    pub fn debug_tap(&self, name: &str, image: &GrayImage) {
        self.put(name, DynamicImage::ImageLuma8(image.clone()));
    }

    fn put(&self, name: &str, image: DynamicImage) {
        let cmd = Command::Put {
            name: name.to_string(),
            image: Arc::new(image),
        };
        if self.tx.try_send(cmd).is_err() {
            warn!(%name, "mjpeg hub command queue full, dropping put");
        }
    }

    /// Registers a new client session on `name` and returns the receiver it should drain to serve
    /// an HTTP multipart response.
    pub async fn subscribe(&self, name: &str, opts: SessionOpts) -> mpsc::Receiver<Bytes> {
        let (respond, respond_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Subscribe {
                name: name.to_string(),
                opts,
                respond,
            })
            .await;
        respond_rx.await.expect("mjpeg hub actor is gone")
    }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut streams: HashMap<String, StreamState> = HashMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Subscribe { name, opts, respond } => {
                let (tx, client_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
                streams
                    .entry(name)
                    .or_default()
                    .clients
                    .push(ClientSession {
                        opts,
                        last_sent: None,
                        tx,
                    });
                let _ = respond.send(client_rx);
            }
            Command::Put { name, image } => {
                let Some(stream) = streams.get_mut(&name) else {
                    continue;
                };
                stream.clients.retain(|c| !c.tx.is_closed());
                dispatch(stream, &image);
            }
        }
    }
}

/// Groups ready clients by their distinct `(width, height, quality)` tuple, JPEG-encodes once per
/// tuple, and fans the bytes out non-blocking. Slow clients whose queue is full simply miss this
/// frame — they are never allowed to back-pressure the source.
fn dispatch(stream: &mut StreamState, image: &DynamicImage) {
    let now = Instant::now();
    let mut groups: HashMap<(u32, u32, u8), Vec<usize>> = HashMap::new();
    for (i, client) in stream.clients.iter().enumerate() {
        if !is_ready(client, now) {
            continue;
        }
        let (w, h) = client.opts.resize.unwrap_or((image.width(), image.height()));
        groups.entry((w, h, client.opts.quality)).or_default().push(i);
    }
    for ((w, h, quality), indices) in groups {
        let part = match encode_part(image, w, h, quality) {
            Ok(p) => p,
            Err(e) => {
                warn!(%e, "mjpeg encode failed");
                continue;
            }
        };
        for i in indices {
            let client = &mut stream.clients[i];
            if client.tx.try_send(part.clone()).is_ok() {
                client.last_sent = Some(now);
            }
        }
    }
}

fn is_ready(client: &ClientSession, now: Instant) -> bool {
    match client.opts.max_fps {
        Some(fps) if fps > 0.0 => client
            .last_sent
            .is_none_or(|last| now.duration_since(last) >= Duration::from_secs_f64(1.0 / fps)),
        _ => true,
    }
}

/// Resizes and JPEG-encodes one frame, then wraps it in its multipart header. The whole value is
/// what gets handed to every ready client sharing this `(width, height, quality)` tuple.
fn encode_part(image: &DynamicImage, width: u32, height: u32, quality: u8) -> Result<Bytes, String> {
    let resized = if (width, height) == (image.width(), image.height()) {
        image.clone()
    } else {
        image.resize_exact(width, height, image::imageops::FilterType::Triangle)
    };
    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), quality);
    encoder
        .encode_image(&resized)
        .map_err(|e| format!("jpeg encode: {e}"))?;
    let mut part = Vec::with_capacity(jpeg.len() + 128);
    part.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(&jpeg);
    part.extend_from_slice(b"\r\n");
    Ok(Bytes::from(part))
}

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::ImageBuffer::from_pixel(w, h, image::Rgb([10, 20, 30])))
    }

    #[test]
    fn encoded_part_has_multipart_framing() {
        let img = solid(8, 8);
        let part = encode_part(&img, 8, 8, 80).unwrap();
        let text_prefix = String::from_utf8_lossy(&part[..part.len().min(80)]);
        assert!(text_prefix.starts_with("--MJPEGBOUNDARY\r\n"));
        assert!(text_prefix.contains("Content-Type: image/jpeg"));
        assert!(part.ends_with(b"\r\n"));
    }

    #[test]
    fn no_fps_cap_is_always_ready() {
        let (tx, _rx) = mpsc::channel(1);
        let client = ClientSession {
            opts: SessionOpts {
                resize: None,
                quality: 80,
                max_fps: None,
            },
            last_sent: Some(Instant::now()),
            tx,
        };
        assert!(is_ready(&client, Instant::now()));
    }

    #[test]
    fn fps_cap_blocks_until_interval_elapses() {
        let (tx, _rx) = mpsc::channel(1);
        let client = ClientSession {
            opts: SessionOpts {
                resize: None,
                quality: 80,
                max_fps: Some(1.0),
            },
            last_sent: Some(Instant::now()),
            tx,
        };
        assert!(!is_ready(&client, Instant::now()));
        assert!(is_ready(&client, Instant::now() + Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn put_with_no_subscribers_is_a_cheap_no_op() {
        let handle = spawn();
        handle.put_rgb("raw", &image::ImageBuffer::from_pixel(4, 4, image::Rgb([1, 2, 3])));
        // Give the actor a chance to process; absence of a panic/hang is the assertion.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn subscriber_receives_a_frame() {
        let handle = spawn();
        let mut rx = handle.subscribe("raw", SessionOpts::default()).await;
        handle.put_rgb("raw", &image::ImageBuffer::from_pixel(4, 4, image::Rgb([1, 2, 3])));
        let part = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        assert!(part.starts_with(b"--MJPEGBOUNDARY\r\n"));
    }
}
