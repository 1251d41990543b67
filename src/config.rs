// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The process-wide config snapshot: loaded from TOML at startup, swapped atomically on
//! `SIGHUP`. See `SPEC_FULL.md` §4.13 and §9 ("Global mutable config").

use arc_swap::ArcSwap;
use base::{bail, err, Error};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_notification_hours_start() -> u8 {
    6
}

fn default_notification_hours_end() -> u8 {
    20
}

fn default_fps() -> f64 {
    10.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct BindConfig {
    pub address: SocketAddr,
    #[serde(default)]
    pub tls: bool,
}

/// The raw TOML shape. Unknown keys are ignored (forward compatibility, per `SPEC_FULL.md` §4.13).
#[derive(Clone, Debug, Deserialize)]
struct Raw {
    uri: String,
    #[serde(default)]
    filesystem_max_size: u64,
    #[serde(default = "default_notification_hours_start")]
    notification_hours_start: u8,
    #[serde(default = "default_notification_hours_end")]
    notification_hours_end: u8,
    #[serde(default)]
    motion_bounds: Vec<(i32, i32)>,
    #[serde(default = "default_motion_thresh")]
    motion_thresh: f32,
    #[serde(default = "default_motion_erode")]
    motion_erode: u32,
    #[serde(default)]
    max_record_time_sec: u64,
    #[serde(default)]
    record_time_sec: u64,
    #[serde(default)]
    buffer_time_sec: u64,
    fullchain_path: Option<PathBuf>,
    privkey_path: Option<PathBuf>,
    base_dir: PathBuf,
    db_path: PathBuf,
    model_path: PathBuf,
    #[serde(default = "default_fps")]
    fps: f64,
    #[serde(default)]
    binds: Vec<BindConfig>,
    bearer_token: Option<String>,
    worker_threads: Option<usize>,
}

fn default_motion_thresh() -> f32 {
    16.0
}

fn default_motion_erode() -> u32 {
    3
}

/// Just the fields [`crate::motion::MotionAnalyzer`] needs, re-read at the top of every analysis
/// step via [`ConfigHandle::motion`] (the "components that need dynamic re-read" hook from
/// `SPEC_FULL.md` §9).
#[derive(Clone, Debug)]
pub struct MotionConfig {
    pub bounds: Vec<(i32, i32)>,
    pub thresh: f32,
    pub erode: u32,
}

/// One immutable, validated config snapshot.
#[derive(Clone, Debug)]
pub struct Config {
    pub uri: String,
    pub filesystem_max_size: u64,
    pub notification_hours_start: u8,
    pub notification_hours_end: u8,
    pub motion: MotionConfig,
    pub max_record_time_sec: u64,
    pub record_time_sec: u64,
    pub buffer_time_sec: u64,
    pub fullchain_path: Option<PathBuf>,
    pub privkey_path: Option<PathBuf>,
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub model_path: PathBuf,
    pub fps: f64,
    pub binds: Vec<BindConfig>,
    pub bearer_token: Option<String>,
    pub worker_threads: Option<usize>,
}

pub const DEFAULT_MAX_RECORD_TIME_SEC: u64 = 5 * 60;
pub const DEFAULT_RECORD_TIME_SEC: u64 = 20;
pub const DEFAULT_BUFFER_TIME_SEC: u64 = 2;

impl Config {
    fn from_raw(raw: Raw) -> Result<Self, Error> {
        if raw.uri.is_empty() {
            bail!(BindError, msg("config: `uri` is required"));
        }
        if raw.notification_hours_start > 24 || raw.notification_hours_end > 24 {
            bail!(BindError, msg("config: notification hours must be within 0..=24"));
        }
        if !raw.motion_bounds.is_empty() && raw.motion_bounds.len() < 3 {
            bail!(BindError, msg("config: `motion_bounds` polygon must be empty or have >= 3 points"));
        }
        for p in [&raw.fullchain_path, &raw.privkey_path].into_iter().flatten() {
            if !p.is_file() {
                bail!(BindError, msg("config: TLS material {} is not readable", p.display()));
            }
        }
        Ok(Config {
            uri: raw.uri,
            filesystem_max_size: raw.filesystem_max_size,
            notification_hours_start: raw.notification_hours_start,
            notification_hours_end: raw.notification_hours_end,
            motion: MotionConfig {
                bounds: raw.motion_bounds,
                thresh: raw.motion_thresh,
                erode: raw.motion_erode,
            },
            max_record_time_sec: if raw.max_record_time_sec == 0 {
                DEFAULT_MAX_RECORD_TIME_SEC
            } else {
                raw.max_record_time_sec
            },
            record_time_sec: if raw.record_time_sec == 0 {
                DEFAULT_RECORD_TIME_SEC
            } else {
                raw.record_time_sec
            },
            buffer_time_sec: if raw.buffer_time_sec == 0 {
                DEFAULT_BUFFER_TIME_SEC
            } else {
                raw.buffer_time_sec
            },
            fullchain_path: raw.fullchain_path,
            privkey_path: raw.privkey_path,
            base_dir: raw.base_dir,
            db_path: raw.db_path,
            model_path: raw.model_path,
            fps: if raw.fps <= 0.0 { default_fps() } else { raw.fps },
            binds: raw.binds,
            bearer_token: raw.bearer_token,
            worker_threads: raw.worker_threads,
        })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err!(BindError, msg("reading config {}: {e}", path.display())))?;
        let raw: Raw = toml::from_str(&text)
            .map_err(|e| err!(BindError, msg("parsing config {}: {e}", path.display())))?;
        Config::from_raw(raw)
    }
}

/// Shared, atomically-swapped config reference. Cloning is cheap (an `Arc` bump); a clone
/// obtained at the top of an operation stays internally consistent even if a reload races
/// concurrently, satisfying the "config reload atomicity" property in `SPEC_FULL.md` §8.
#[derive(Clone)]
pub struct ConfigHandle(Arc<ArcSwap<Config>>);

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        ConfigHandle(Arc::new(ArcSwap::new(Arc::new(config))))
    }

    pub fn current(&self) -> Arc<Config> {
        self.0.load_full()
    }

    /// Re-reads `path` and swaps in the new snapshot. Called on `SIGHUP`, and directly by tests.
    pub fn reload(&self, path: &Path) -> Result<(), Error> {
        let fresh = Config::load(path)?;
        self.0.store(Arc::new(fresh));
        Ok(())
    }

    /// Convenience accessor for [`crate::motion::MotionAnalyzer`]'s per-step `refresh()` hook.
    pub fn motion(&self) -> MotionConfig {
        self.current().motion.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL_PATH_LINE: &str = "model_path = \"/tmp/model.onnx\"\n";

    fn write_toml(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("camwatch.toml");
        std::fs::write(&path, format!("{MODEL_PATH_LINE}{body}")).unwrap();
        path
    }

    #[test]
    fn missing_uri_is_bind_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(dir.path(), "base_dir = \"/tmp\"\ndb_path = \"/tmp/db\"\nuri = \"\"\n");
        let e = Config::load(&path).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::BindError);
    }

    #[test]
    fn zero_thresholds_use_compiled_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            "uri = \"rtsp://example/stream\"\nbase_dir = \"/tmp\"\ndb_path = \"/tmp/db\"\n",
        );
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.max_record_time_sec, DEFAULT_MAX_RECORD_TIME_SEC);
        assert_eq!(cfg.record_time_sec, DEFAULT_RECORD_TIME_SEC);
        assert_eq!(cfg.buffer_time_sec, DEFAULT_BUFFER_TIME_SEC);
        assert_eq!(cfg.notification_hours_start, 6);
        assert_eq!(cfg.notification_hours_end, 20);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            "uri = \"rtsp://example/stream\"\nbase_dir = \"/tmp\"\ndb_path = \"/tmp/db\"\n\
             some_future_field = 42\n",
        );
        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            "uri = \"rtsp://a/1\"\nbase_dir = \"/tmp\"\ndb_path = \"/tmp/db\"\n",
        );
        let handle = ConfigHandle::new(Config::load(&path).unwrap());
        assert_eq!(handle.current().uri, "rtsp://a/1");
        write_toml(dir.path(), "uri = \"rtsp://b/2\"\nbase_dir = \"/tmp\"\ndb_path = \"/tmp/db\"\n");
        handle.reload(&path).unwrap();
        assert_eq!(handle.current().uri, "rtsp://b/2");
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            "uri = \"rtsp://a/1\"\nbase_dir = \"/tmp\"\ndb_path = \"/tmp/db\"\n\
             motion_bounds = [[0, 0], [1, 1]]\n",
        );
        let e = Config::load(&path).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::BindError);
    }
}
