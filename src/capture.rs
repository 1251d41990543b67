// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The capture source: decodes a camera URI by spawning the same external encoder binary used by
//! [`crate::encoder`], in reverse, and delivers timestamped [`Frame`]s on a channel. See
//! `SPEC_FULL.md` §4.2.

use crate::encoder::locate_ffmpeg;
use crate::frame::{Frame, FramePool};
use base::clock::Clocks;
use base::shutdown;
use base::{err, Error};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

const DISCONNECT_DELAY: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// A camera's pixel dimensions, as latched by the first successful read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

struct Shared {
    connected: std::sync::atomic::AtomicBool,
    size: Mutex<Option<Size>>,
}

/// A running capture source: a dedicated OS thread owns the reconnect loop and hands frames to
/// callers over a bounded channel.
pub struct CaptureSource {
    shared: Arc<Shared>,
    rx: Mutex<Receiver<Frame>>,
    shutdown_tx: Option<shutdown::Sender>,
    join: Option<std::thread::JoinHandle<()>>,
}

pub struct CaptureSpec {
    pub uri: String,
    pub target_fps: f64,
    pub pool: FramePool,
    pub queue_depth: usize,
}

impl CaptureSource {
    /// Spawns the capture loop thread. Does not block for the first frame — call
    /// [`CaptureSource::size`] to wait for it.
    pub fn open<C: Clocks>(spec: CaptureSpec, clocks: Arc<C>) -> Self {
        let (tx, rx) = sync_channel(spec.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let shared = Arc::new(Shared {
            connected: std::sync::atomic::AtomicBool::new(false),
            size: Mutex::new(None),
        });
        let loop_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || run_loop(spec, &*clocks, tx, shutdown_rx, loop_shared))
            .expect("spawning capture thread");
        CaptureSource {
            shared,
            rx: Mutex::new(rx),
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Blocks (polling every 50ms) until the first frame has been read and dimensions are known.
    pub fn size<C: Clocks>(&self, clocks: &C) -> Size {
        loop {
            if let Some(s) = *self.shared.size.lock().unwrap() {
                return s;
            }
            clocks.sleep(Duration::from_millis(50));
        }
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Blocks the calling thread for the next frame, or returns `None` once the source is closed.
    pub fn recv(&self) -> Option<Frame> {
        self.rx.lock().unwrap().recv().ok()
    }

    /// Signals the capture thread to stop and blocks until it has drained its resources.
    pub fn close(mut self) {
        self.shutdown_tx.take(); // dropping the Sender wakes the loop
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn target_period(uri: &str, target_fps: f64) -> Duration {
    if uri.ends_with(".mp4") {
        Duration::from_secs_f64(1.0 / target_fps)
    } else {
        // Live sources: read as fast as the external decoder delivers, with only a ceiling.
        Duration::from_secs_f64(1.0 / 100.0)
    }
}

fn spawn_decoder(uri: &str) -> Result<Child, Error> {
    let ffmpeg = locate_ffmpeg()?;
    Command::new(ffmpeg)
        .args(["-i", uri, "-f", "rawvideo", "-pix_fmt", "bgr24", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| err!(BindError, msg("spawning capture decoder for {uri:?}: {e}")))
}

/// Probes dimensions with `ffprobe`, since the raw pipe carries no header to read them from.
fn probe_size(uri: &str) -> Result<Size, Error> {
    let ffprobe = locate_ffmpeg()?.with_file_name("ffprobe");
    let output = Command::new(ffprobe)
        .args([
            "-v", "error", "-select_streams", "v:0", "-show_entries", "stream=width,height",
            "-of", "csv=s=x:p=0",
        ])
        .arg(uri)
        .output()
        .map_err(|e| err!(BindError, msg("probing capture size for {uri:?}: {e}")))?;
    if !output.status.success() {
        return Err(err!(BindError, msg("ffprobe exited with {} for {uri:?}", output.status)));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let (w, h) = text
        .trim()
        .split_once('x')
        .ok_or_else(|| err!(BindError, msg("unparseable ffprobe size output {text:?}")))?;
    Ok(Size {
        width: w.parse().map_err(|_| err!(BindError, msg("bad width in {text:?}")))?,
        height: h.parse().map_err(|_| err!(BindError, msg("bad height in {text:?}")))?,
    })
}

fn read_frame(stdout: &mut ChildStdout, buf: &mut [u8]) -> std::io::Result<()> {
    stdout.read_exact(buf)
}

fn run_loop<C: Clocks>(
    spec: CaptureSpec,
    clocks: &C,
    tx: SyncSender<Frame>,
    shutdown_rx: shutdown::Receiver,
    shared: Arc<Shared>,
) {
    // A bad URI fails the size probe once, up front, with BindError; that's reported via the
    // first size() poll finding no dimensions forever. We still attempt the decode loop in case
    // the probe was merely transient (e.g. RTSP momentarily unreachable at startup).
    let size = match probe_size(&spec.uri) {
        Ok(s) => s,
        Err(e) => {
            warn!(err = %e.chain(), "capture size probe failed; will keep retrying");
            Size { width: 0, height: 0 }
        }
    };
    if size.width != 0 {
        *shared.size.lock().unwrap() = Some(size);
    }

    let period = target_period(&spec.uri, spec.target_fps);

    'reconnect: loop {
        if shutdown_rx.check().is_err() {
            break;
        }
        let mut child = match spawn_decoder(&spec.uri) {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e.chain(), "capture decoder spawn failed, retrying");
                if shutdown_rx.wait_for(RETRY_DELAY).is_err() {
                    break;
                }
                continue;
            }
        };
        let mut stdout = match child.stdout.take() {
            Some(s) => s,
            None => continue,
        };

        let effective_size = if size.width != 0 {
            size
        } else {
            match probe_size(&spec.uri) {
                Ok(s) => {
                    *shared.size.lock().unwrap() = Some(s);
                    s
                }
                Err(_) => {
                    let _ = child.kill();
                    if shutdown_rx.wait_for(RETRY_DELAY).is_err() {
                        break;
                    }
                    continue;
                }
            }
        };
        let frame_bytes = effective_size.width as usize
            * effective_size.height as usize
            * crate::frame::BYTES_PER_PIXEL;
        let mut buf = vec![0u8; frame_bytes];

        shared.connected.store(true, std::sync::atomic::Ordering::Release);
        info!(uri = %spec.uri, ?effective_size, "capture connected");
        let mut last_fetch = Instant::now();

        loop {
            if shutdown_rx.check().is_err() {
                let _ = child.kill();
                break 'reconnect;
            }
            match read_frame(&mut stdout, &mut buf) {
                Ok(()) => {
                    last_fetch = Instant::now();
                    let frame = match spec.pool.acquire(
                        effective_size.width,
                        effective_size.height,
                        SystemTime::now(),
                    ) {
                        Ok(mut f) => {
                            f.pixels_mut().copy_from_slice(&buf);
                            f
                        }
                        Err(e) => {
                            warn!(err = %e.chain(), "dropping frame: pool exhausted");
                            continue;
                        }
                    };
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("capture downstream channel full, dropping frame");
                        }
                        Err(TrySendError::Disconnected(_)) => break 'reconnect,
                    }
                    if period > Duration::ZERO {
                        clocks.sleep(period);
                    }
                }
                Err(e) => {
                    debug!(err = %e, "capture read failed");
                    break;
                }
            }
            if last_fetch.elapsed() >= DISCONNECT_DELAY {
                warn!("no frame for disconnectDelay, reconnecting");
                break;
            }
        }

        shared.connected.store(false, std::sync::atomic::Ordering::Release);
        let _ = child.kill();
        let _ = child.wait();
        if shutdown_rx.wait_for(RETRY_DELAY).is_err() {
            break;
        }
    }
    drop(tx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_period_uses_container_rate_for_files() {
        let p = target_period("clip.mp4", 25.0);
        assert_eq!(p, Duration::from_secs_f64(1.0 / 25.0));
    }

    #[test]
    fn target_period_uses_high_ceiling_for_live_uris() {
        let p = target_period("rtsp://example/stream", 25.0);
        assert_eq!(p, Duration::from_secs_f64(1.0 / 100.0));
    }
}
