// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The central state machine: one actor task turning motion events into recordings. See
//! `SPEC_FULL.md` §4.9.
//!
//! Exactly one active recording at a time. Events arrive on a single inbound channel, so the
//! state transitions below never race each other — the classic "actor owns its own state"
//! pattern this crate uses throughout (compare `store::Actor`).

use crate::classifier::{Classifier, Detections};
use crate::config::ConfigHandle;
use crate::frame::{Frame, FramePool};
use crate::motion::Event as MotionEvent;
use crate::notifier::Notifier;
use crate::preroll::PreRollBuffer;
use crate::sink::Sink;
use crate::video_sink::VideoSink;
use base::{err, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, warn};

enum Command {
    Put { frame: Frame, ack: oneshot::Sender<Result<(), Error>> },
    Motion(MotionEvent),
    Close { ack: oneshot::Sender<()> },
    SubscribeNotifications {
        resp: oneshot::Sender<tokio::sync::broadcast::Receiver<crate::notifier::Notification>>,
    },
}

/// Cheap-clone handle to the recorder actor.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<Command>,
}

impl Handle {
    /// Forwards one frame to pre-roll (and, if a recording is active, the live encode). Waits
    /// for the actor to apply it before returning, matching the "always acknowledged
    /// synchronously" rule in `SPEC_FULL.md` §4.9.
    pub async fn put(&self, frame: Frame) -> Result<(), Error> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Put { frame, ack })
            .await
            .map_err(|_| err!(Internal, msg("recorder actor is gone")))?;
        ack_rx
            .await
            .map_err(|_| err!(Internal, msg("recorder actor dropped response")))?
    }

    pub async fn motion(&self, event: MotionEvent) {
        if self.tx.send(Command::Motion(event)).await.is_err() {
            warn!("recorder actor is gone, dropping motion event");
        }
    }

    /// Closes any active recording synchronously and terminates the actor.
    pub async fn close(&self) {
        let (ack, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Close { ack }).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Subscribes to the actor's internal [`crate::notifier::Notifier`], for `/notifyws`.
    pub async fn subscribe_notifications(&self) -> tokio::sync::broadcast::Receiver<crate::notifier::Notification> {
        let (resp, resp_rx) = oneshot::channel();
        if self.tx.send(Command::SubscribeNotifications { resp }).await.is_err() {
            // Actor is gone; hand back a receiver on a channel that will never produce anything,
            // so callers can still select on it instead of handling a distinct error case.
            let (tx, rx) = tokio::sync::broadcast::channel(1);
            drop(tx);
            return rx;
        }
        resp_rx.await.unwrap_or_else(|_| {
            let (tx, rx) = tokio::sync::broadcast::channel(1);
            drop(tx);
            rx
        })
    }
}

pub struct Params {
    pub store: store::Handle,
    pub pool: FramePool,
    pub classifier: Arc<Classifier>,
    pub config: ConfigHandle,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

struct Active {
    record: store::Record,
    out: VideoSink,
    detections: Detections,
    stop_short: Instant,
    stop_long: Instant,
}

struct Actor {
    params: Params,
    pre_roll: PreRollBuffer,
    notifier: Notifier,
    active: Option<Active>,
}

pub fn spawn(params: Params, pre_roll: PreRollBuffer) -> Handle {
    let (tx, rx) = mpsc::channel(64);
    let actor = Actor {
        params,
        pre_roll,
        notifier: Notifier::new(),
        active: None,
    };
    tokio::spawn(run(actor, rx));
    Handle { tx }
}

async fn run(mut actor: Actor, mut rx: mpsc::Receiver<Command>) {
    loop {
        let deadline = actor.active.as_ref().map(|a| a.stop_short.min(a.stop_long));
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Put { frame, ack }) => {
                        let result = actor.on_put(frame).await;
                        let _ = ack.send(result);
                    }
                    Some(Command::Motion(event)) => actor.on_motion(event).await,
                    Some(Command::Close { ack }) => {
                        actor.on_close().await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(Command::SubscribeNotifications { resp }) => {
                        let _ = resp.send(actor.notifier.subscribe());
                    }
                    None => {
                        actor.on_close().await;
                        return;
                    }
                }
            }
            _ = sleep_until_opt(deadline) => {
                actor.on_timer().await;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn on_put(&mut self, frame: Frame) -> Result<(), Error> {
        self.pre_roll.put(&frame)?;
        if let Some(active) = self.active.as_mut() {
            active.out.put(frame)?;
        }
        Ok(())
    }

    async fn on_motion(&mut self, event: MotionEvent) {
        match event {
            MotionEvent::MotionDetected => self.on_motion_detected().await,
            MotionEvent::MotionClassified(detections) => self.on_motion_classified(detections).await,
        }
    }

    async fn on_motion_detected(&mut self) {
        let config = self.params.config.current();
        let now = Instant::now();
        if self.active.is_none() {
            let triggered_at = std::time::SystemTime::now();
            let record = match self.params.store.new_record(triggered_at).await {
                Ok(r) => r,
                Err(e) => {
                    error!(err = %e.chain(), "failed to create recording; dropping trigger");
                    return;
                }
            };
            let first_frame = match self.pre_roll.get_last() {
                Ok(f) => f,
                Err(e) => {
                    warn!(err = %e.chain(), "failed to snapshot pre-roll last frame");
                    None
                }
            };
            let mut out = match VideoSink::open(
                self.params.store.clone(),
                &record,
                self.params.pool.clone(),
                self.params.width,
                self.params.height,
                self.params.fps,
                config.buffer_time_sec as u32,
                first_frame,
            ) {
                Ok(sink) => sink,
                Err(e) => {
                    error!(err = %e.chain(), "failed to open video sink; dropping trigger");
                    return;
                }
            };
            if let Err(e) = self.pre_roll.flush(&mut out) {
                warn!(err = %e.chain(), "failed to flush pre-roll into new recording");
            }
            self.params.classifier.enable();
            self.notifier.start_recording(&record);
            info!(identifier = %record.identifier, "recording started");
            self.active = Some(Active {
                record,
                out,
                detections: Detections::default(),
                stop_short: now + Duration::from_secs(config.record_time_sec),
                stop_long: now + Duration::from_secs(config.max_record_time_sec),
            });
        } else if let Some(active) = self.active.as_mut() {
            active.stop_short = now + Duration::from_secs(config.record_time_sec);
        }
    }

    async fn on_motion_classified(&mut self, detections: Detections) {
        let config = self.params.config.current();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let was_empty = active.detections.is_empty();
        active.detections.merge(&detections);
        self.notifier.motion_classified(
            &active.detections,
            config.notification_hours_start,
            config.notification_hours_end,
        );
        if was_empty && !active.detections.is_empty() {
            let identifier = active.record.identifier.clone();
            let preview = active.detections.clone();
            let store = self.params.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.set_detections(&identifier, preview).await {
                    warn!(err = %e.chain(), "failed to persist preview classification");
                }
            });
        }
    }

    async fn on_timer(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.finish_recording(active).await;
    }

    async fn on_close(&mut self) {
        if let Some(active) = self.active.take() {
            self.finish_recording(active).await;
        }
        self.pre_roll.close();
    }

    async fn finish_recording(&mut self, active: Active) {
        let identifier = active.record.identifier.clone();
        self.params.classifier.disable();
        if let Err(e) = active.out.close(active.detections).await {
            error!(%identifier, err = %e.chain(), "failed to close recording");
        }
        self.notifier.stop_recording();
        info!(%identifier, "recording stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    #[test]
    fn sleep_until_opt_none_never_resolves_immediately() {
        // Regression guard: `std::future::pending` must be the None arm, not an immediately-ready
        // future, or the actor loop would spin instead of idling.
        let fut = sleep_until_opt(None);
        tokio::pin!(fut);
        let waker = futures::task::noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        assert!(fut.as_mut().poll(&mut cx).is_pending());
    }
}
