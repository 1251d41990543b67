// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `camwatch run`: wires the whole pipeline together — capture, motion analysis, the recorder
//! state machine, the event store's garbage collector, and the web server — and runs it until a
//! shutdown signal arrives. See `SPEC_FULL.md` §2 (dataflow) and §5 (concurrency model).

use crate::capture::{CaptureSource, CaptureSpec};
use crate::classifier::Classifier;
use crate::config::{Config, ConfigHandle};
use crate::encoder;
use crate::frame::FramePool;
use crate::mjpeg;
use crate::motion::{self, MotionAnalyzer};
use crate::preroll::PreRollBuffer;
use crate::recorder;
use crate::web;
use base::clock::RealClocks;
use base::{err, shutdown, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Hard cap on simultaneously live frame buffers; exceeding it is a bug (`SPEC_FULL.md` §4.1).
const FRAME_POOL_CAP: usize = 500;
const CAPTURE_QUEUE_DEPTH: usize = 8;
const GC_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Bpaf, Debug)]
#[bpaf(options("run"))]
pub struct Args {
    #[bpaf(external(super::config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    base::time::init_zone(jiff::tz::TimeZone::system);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = config.worker_threads {
        builder.worker_threads(n);
    }
    let rt = builder
        .build()
        .map_err(|e| err!(Internal, msg("building tokio runtime: {e}")))?;
    rt.block_on(async_run(args.config, config))
}

async fn async_run(config_path: PathBuf, config: Config) -> Result<i32, Error> {
    // Fail fast if the encoder binary can't be found, per `SPEC_FULL.md` §6, rather than
    // discovering it much later inside the first `encoder::spawn_child`.
    encoder::locate_ffmpeg()?;

    let config = ConfigHandle::new(config);
    let snapshot = config.current();

    let store = store::open(&snapshot.db_path, snapshot.base_dir.clone())?;
    let pool = FramePool::new(FRAME_POOL_CAP);
    let mjpeg_hub = mjpeg::spawn();
    let classifier = Arc::new(Classifier::load(&snapshot.model_path)?);

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let capture = CaptureSource::open(
        CaptureSpec {
            uri: snapshot.uri.clone(),
            target_fps: snapshot.fps,
            pool: pool.clone(),
            queue_depth: CAPTURE_QUEUE_DEPTH,
        },
        Arc::new(RealClocks {}),
    );
    // `size()` polls synchronously until the first frame arrives; run it without tying up an
    // async worker thread for the (possibly multi-second) wait.
    let size = tokio::task::block_in_place(|| capture.size(&RealClocks {}));
    info!(width = size.width, height = size.height, uri = %snapshot.uri, "capture opened");

    let pre_roll = PreRollBuffer::new(pool.clone(), Duration::from_secs(snapshot.buffer_time_sec));
    let recorder = recorder::spawn(
        recorder::Params {
            store: store.clone(),
            pool: pool.clone(),
            classifier: classifier.clone(),
            config: config.clone(),
            width: size.width,
            height: size.height,
            fps: snapshot.fps,
        },
        pre_roll,
    );

    let pipeline = spawn_pipeline(
        capture,
        mjpeg_hub.clone(),
        classifier,
        config.clone(),
        recorder.clone(),
        shutdown_rx.clone(),
    );

    let gc_task = tokio::spawn(gc_loop(store.clone(), config.clone(), shutdown_rx.clone()));
    let reload_task = tokio::spawn(config_reload_loop(config.clone(), config_path, shutdown_rx.clone()));

    let app_state = Arc::new(web::AppState {
        config: config.clone(),
        store: store.clone(),
        recorder: recorder.clone(),
        mjpeg: mjpeg_hub,
    });

    let mut servers = Vec::new();
    for bind in &snapshot.binds {
        if bind.tls {
            // TLS termination is a composition-root / HTTP-multiplexing concern, explicitly out
            // of this crate's scope (`SPEC_FULL.md` §1); `fullchain_path`/`privkey_path` are
            // validated at config load time for whatever front end terminates it.
            warn!(addr = %bind.address, "TLS requested for this bind but is not terminated by this process");
        }
        servers.push(tokio::spawn(web::serve(bind.address, app_state.clone(), shutdown_rx.clone())));
    }
    if servers.is_empty() {
        warn!("no `binds` configured in camwatch.toml; the web server will not listen on any address");
    }

    wait_for_shutdown_signal().await?;
    info!("shutdown requested");
    drop(shutdown_tx);

    for server in servers {
        match server.await {
            Ok(Err(e)) => warn!(err = %e.chain(), "web server task exited with an error"),
            Err(e) => warn!(%e, "web server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    let _ = gc_task.await;
    let _ = reload_task.await;

    recorder.close().await;
    if let Err(e) = tokio::task::spawn_blocking(move || pipeline.join()).await {
        warn!(%e, "pipeline join task panicked");
    }
    pool.shutdown();

    info!("exiting");
    Ok(0)
}

/// The main capture→fan-out loop, on its own OS thread since [`CaptureSource::recv`] blocks
/// synchronously. Per `SPEC_FULL.md` §5: within one step, publish to MJPEG-raw, then motion,
/// then the recorder — the frame is released only after all three have returned.
fn spawn_pipeline(
    capture: CaptureSource,
    mjpeg_hub: mjpeg::Handle,
    classifier: Arc<Classifier>,
    config: ConfigHandle,
    recorder: recorder::Handle,
    shutdown_rx: shutdown::Receiver,
) -> std::thread::JoinHandle<()> {
    let rt_handle = tokio::runtime::Handle::current();
    std::thread::Builder::new()
        .name("pipeline".into())
        .spawn(move || {
            let mut analyzer = MotionAnalyzer::new(classifier, mjpeg_hub.clone());
            loop {
                if shutdown_rx.check().is_err() {
                    break;
                }
                let Some(frame) = capture.recv() else {
                    break;
                };

                let rgb = motion::frame_to_rgb(&frame);
                mjpeg_hub.put_rgb("raw", &rgb);

                match analyzer.process(&frame, &config.motion()) {
                    Ok(events) => {
                        for event in events {
                            rt_handle.block_on(recorder.motion(event));
                        }
                    }
                    Err(e) => warn!(err = %e.chain(), "motion analysis failed for this frame"),
                }

                if let Err(e) = rt_handle.block_on(recorder.put(frame)) {
                    warn!(err = %e.chain(), "recorder failed to accept frame");
                }
            }
            capture.close();
        })
        .expect("spawning pipeline thread")
}

/// Periodic size-/age-based GC sweep. See `SPEC_FULL.md` §4.11; `MaxAge` is not currently exposed
/// as a config field (`SPEC_FULL.md` §6 only lists `FilesystemMaxSize`), so that branch is always
/// disabled here.
async fn gc_loop(store: store::Handle, config: ConfigHandle, shutdown_rx: shutdown::Receiver) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(GC_INTERVAL) => {}
            _ = shutdown_rx.as_future() => break,
        }
        let snapshot = config.current();
        match store.gc_now(snapshot.filesystem_max_size, None).await {
            Ok(n) if n > 0 => info!(count = n, "GC deleted records"),
            Ok(_) => {}
            Err(e) => warn!(err = %e.chain(), "GC sweep failed"),
        }
    }
}

/// Re-reads `camwatch.toml` and atomically swaps the config snapshot on `SIGHUP`, the live-reload
/// hook `ConfigHandle` documents itself as supporting.
async fn config_reload_loop(config: ConfigHandle, path: PathBuf, shutdown_rx: shutdown::Receiver) {
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(%e, "failed to install SIGHUP handler; config hot-reload is disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = sighup.recv() => match config.reload(&path) {
                Ok(()) => info!("config reloaded"),
                Err(e) => warn!(err = %e.chain(), "config reload failed; keeping previous snapshot"),
            },
            _ = shutdown_rx.as_future() => break,
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<(), Error> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| err!(Internal, msg("installing SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| err!(Internal, msg("installing SIGTERM handler: {e}")))?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
