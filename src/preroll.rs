// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Bounded-age FIFO of recent frames, flushed into a new clip's encoder on trigger.
//!
//! Owned exclusively by the [`crate::recorder`] actor thread — no internal locking. Keeping it a
//! plain struct rather than its own actor avoids a pointless extra hop on the capture hot path
//! (every frame passes through `put` once per loop step).

use crate::frame::{Frame, FramePool};
use crate::sink::Sink;
use base::Error;
use std::collections::VecDeque;
use std::time::Duration;

pub struct PreRollBuffer {
    pool: FramePool,
    buffer_time: Duration,
    frames: VecDeque<Frame>,
}

impl PreRollBuffer {
    pub fn new(pool: FramePool, buffer_time: Duration) -> Self {
        PreRollBuffer {
            pool,
            buffer_time,
            frames: VecDeque::new(),
        }
    }

    /// Takes ownership of `frame` by copying it into the buffer's own pool, then evicts every
    /// head frame older than `buffer_time` relative to the new latest frame.
    ///
    /// Invariant maintained after every call: for all held frames `f`, `latest.time - f.time <
    /// buffer_time`.
    pub fn put(&mut self, frame: &Frame) -> Result<(), Error> {
        let owned = frame.clone_into(&self.pool)?;
        let latest = owned.timestamp;
        self.frames.push_back(owned);
        while let Some(head) = self.frames.front() {
            match latest.duration_since(head.timestamp) {
                Ok(age) if age >= self.buffer_time => {
                    self.frames.pop_front();
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Delivers buffered frames oldest-first to `sink`, then drops them from the buffer. Returns
    /// once the sink has accepted every frame (a synchronous handoff — no lock is held during
    /// sink I/O since this struct isn't shared across threads).
    pub fn flush(&mut self, sink: &mut dyn Sink) -> Result<(), Error> {
        for frame in self.frames.drain(..) {
            sink.put(frame)?;
        }
        Ok(())
    }

    /// Returns a pool-owned copy of the most recently buffered frame, if any.
    pub fn get_last(&self) -> Result<Option<Frame>, Error> {
        self.frames.back().map(|f| f.clone_into(&self.pool)).transpose()
    }

    pub fn close(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn frame_at(pool: &FramePool, t: SystemTime) -> Frame {
        pool.acquire(1, 1, t).unwrap()
    }

    #[test]
    fn age_bound_holds_after_every_put() {
        let pool = FramePool::new(64);
        let mut buf = PreRollBuffer::new(pool.clone(), Duration::from_secs(2));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        for i in 0..10 {
            let t = t0 + Duration::from_millis(i * 500);
            buf.put(&frame_at(&pool, t)).unwrap();
            let latest = buf.frames.back().unwrap().timestamp;
            for f in &buf.frames {
                assert!(latest.duration_since(f.timestamp).unwrap() < Duration::from_secs(2));
            }
        }
    }

    #[test]
    fn flush_delivers_oldest_first_and_empties() {
        let pool = FramePool::new(64);
        let mut buf = PreRollBuffer::new(pool.clone(), Duration::from_secs(10));
        let t0 = SystemTime::UNIX_EPOCH;
        for i in 0..3 {
            buf.put(&frame_at(&pool, t0 + Duration::from_millis(i * 100))).unwrap();
        }
        struct Collect(Vec<SystemTime>);
        impl Sink for Collect {
            fn put(&mut self, frame: Frame) -> Result<(), Error> {
                self.0.push(frame.timestamp);
                Ok(())
            }
        }
        let mut collected = Collect(Vec::new());
        buf.flush(&mut collected).unwrap();
        assert_eq!(collected.0, vec![
            t0,
            t0 + Duration::from_millis(100),
            t0 + Duration::from_millis(200),
        ]);
        assert!(buf.frames.is_empty());
    }
}
