// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The encoder sink: a child `ffmpeg` process fed raw BGR24 frames over its stdin, producing one
//! H.264 mp4 per recording. See `SPEC_FULL.md` §4.4.

use crate::frame::Frame;
use crate::sink::Sink;
use base::{bail, err, Error};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Resolves the external encoder binary: `FFMPEG` env override, then `PATH` lookup, then fail.
/// This is the canonical resolution order from `SPEC_FULL.md` §9 ("Open questions — resolved").
pub fn locate_ffmpeg() -> Result<PathBuf, Error> {
    if let Ok(p) = std::env::var("FFMPEG") {
        return Ok(PathBuf::from(p));
    }
    for dir in std::env::var_os("PATH").iter().flat_map(std::env::split_paths) {
        let candidate = dir.join("ffmpeg");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!(
        BindError,
        msg("couldn't locate the `ffmpeg` binary: set FFMPEG or add it to PATH")
    );
}

/// Caches the result of a successful [`locate_ffmpeg`] call; a failed lookup is never cached, so
/// callers keep getting the real `BindError` instead of a silently wrong fallback path.
fn ffmpeg_path() -> Result<&'static Path, Error> {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    if let Some(p) = PATH.get() {
        return Ok(p.as_path());
    }
    let found = locate_ffmpeg()?;
    Ok(PATH.get_or_init(|| found).as_path())
}

enum Msg {
    Frame(Frame),
    Close,
}

/// A running encoder: a dedicated writer thread owns the child process and its stdin pipe.
///
/// `put` enqueues a frame onto a bounded channel sized `fps * (pre_roll_seconds + 20)` so an
/// initial pre-roll flush doesn't block live frames; if the channel is full the frame is dropped
/// with a warning, matching the "output integrity at steady state is preserved by upstream
/// rate-limiting" design in §4.4.
pub struct EncoderSink {
    tx: SyncSender<Msg>,
    join: Option<std::thread::JoinHandle<Result<(), Error>>>,
}

pub struct EncoderSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pre_roll_seconds: u32,
}

const QUEUE_SLACK: u32 = 20;

impl EncoderSink {
    pub fn new(spec: EncoderSpec) -> Result<Self, Error> {
        let cap = ((spec.fps * (spec.pre_roll_seconds as f64 + QUEUE_SLACK as f64)).ceil() as usize).max(1);
        let (tx, rx) = sync_channel(cap);
        let temp_path = store::temp_path(&spec.path);
        let join = std::thread::Builder::new()
            .name("encoder".into())
            .spawn(move || run_writer(spec, temp_path, rx))
            .map_err(|e| err!(Internal, msg("spawning encoder writer thread: {e}")))?;
        Ok(EncoderSink {
            tx,
            join: Some(join),
        })
    }

    /// Signals end-of-stream and blocks until the child exits and the file is renamed into place.
    pub fn close(mut self) -> Result<(), Error> {
        let _ = self.tx.send(Msg::Close);
        let join = self.join.take().expect("close called once");
        join.join()
            .map_err(|_| err!(Internal, msg("encoder writer thread panicked")))?
    }
}

impl Sink for EncoderSink {
    fn put(&mut self, frame: Frame) -> Result<(), Error> {
        match self.tx.try_send(Msg::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("encoder queue full, dropping frame");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(err!(TransientIOError, msg("encoder writer thread is gone")))
            }
        }
    }
}

fn spawn_child(spec: &EncoderSpec, temp_path: &Path) -> Result<Child, Error> {
    let size = format!("{}x{}", spec.width, spec.height);
    Command::new(ffmpeg_path()?)
        .args([
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgr24",
            "-video_size",
            &size,
            "-framerate",
            &spec.fps.to_string(),
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-crf",
            "30",
            "-pix_fmt",
            "yuv420p",
            "-profile:v",
            "baseline",
            "-level",
            "3.0",
            "-movflags",
            "+faststart",
            "-f",
            "mp4",
        ])
        .arg(temp_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| err!(BindError, msg("spawning encoder: {e}")))
}

fn run_writer(spec: EncoderSpec, temp_path: PathBuf, rx: Receiver<Msg>) -> Result<(), Error> {
    let mut child = spawn_child(&spec, &temp_path)?;
    let mut stdin = child.stdin.take().expect("piped stdin");

    for msg in rx {
        match msg {
            Msg::Frame(frame) => {
                if let Err(e) = stdin.write_all(frame.pixels()) {
                    warn!(%e, "encoder stdin write failed, dropping frame");
                }
            }
            Msg::Close => break,
        }
    }
    drop(stdin);

    let status = child
        .wait()
        .map_err(|e| err!(Internal, msg("waiting for encoder exit: {e}")))?;
    if !status.success() {
        return Err(err!(Internal, msg("encoder exited with {status}")));
    }
    std::fs::rename(&temp_path, spec.path)
        .map_err(|e| err!(Internal, msg("renaming finished artifact: {e}")))?;
    debug!("encoder finished");
    Ok(())
}

/// Probes a finished mp4's duration with `ffprobe`, used to fill `Record.video_duration_sec`.
/// A probe failure is `CorruptArtifact` — logged, never fatal (see `SPEC_FULL.md` §7).
pub fn probe_duration_sec(path: &Path) -> Result<f64, Error> {
    let ffprobe = ffmpeg_path()?.with_file_name("ffprobe");
    let output = Command::new(&ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .map_err(|e| err!(CorruptArtifact, msg("running ffprobe: {e}")))?;
    if !output.status.success() {
        return Err(err!(CorruptArtifact, msg("ffprobe exited with {}", output.status)));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<f64>()
        .map_err(|e| err!(CorruptArtifact, msg("parsing ffprobe duration {text:?}: {e}")))
}

/// Spawns a video-thumbnail transcode job: downscale, 3fps, 10x speedup, trimmed to 5s — see
/// `SPEC_FULL.md` §4.10. Blocks the calling thread until the child exits; callers run this on a
/// background thread.
pub fn make_video_thumbnail(source: &Path, dest: &Path) -> Result<(), Error> {
    let temp_path = store::temp_path(dest);
    let status = Command::new(ffmpeg_path()?)
        .args(["-y", "-i"])
        .arg(source)
        .args([
            "-t",
            "5",
            "-vf",
            "scale=320:180,setpts=0.1*PTS",
            "-r",
            "3",
            "-an",
            "-pix_fmt",
            "yuv420p",
            "-profile:v",
            "baseline",
            "-level",
            "3.0",
            "-f",
            "mp4",
        ])
        .arg(&temp_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .status()
        .map_err(|e| err!(TransientIOError, msg("spawning video-thumbnail encoder: {e}")))?;
    if !status.success() {
        return Err(err!(TransientIOError, msg("video-thumbnail encoder exited with {status}")));
    }
    std::fs::rename(&temp_path, dest)
        .map_err(|e| err!(Internal, msg("renaming video thumbnail: {e}")))?;
    info!(?dest, "video thumbnail ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_ffmpeg_honors_env_override() {
        std::env::set_var("FFMPEG", "/nonexistent/custom-ffmpeg");
        let p = locate_ffmpeg().unwrap();
        assert_eq!(p, PathBuf::from("/nonexistent/custom-ffmpeg"));
        std::env::remove_var("FFMPEG");
    }
}
