// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The [`Frame`] buffer type and its recycling [`FramePool`].
//!
//! Every stage of the pipeline (capture, motion, MJPEG, the recorder's encoder sink) passes
//! frames by value; a `Frame` is just a handle back to its pool, so dropping one returns its
//! buffer to the free list automatically instead of requiring callers to remember to release it.

use base::{bail, err, Error};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Packed 8-bit BGR, matching the wire format the capture source and encoder sink exchange with
/// the external encoder binary (see `SPEC_FULL.md` §4.2's transport note).
pub const BYTES_PER_PIXEL: usize = 3;

struct Inner {
    free: Mutex<Vec<Vec<u8>>>,
    live: AtomicUsize,
    cap: usize,
}

/// Recycling allocator for frame pixel buffers.
///
/// All operations are serializable through the internal mutex, satisfying the "single-owner
/// concurrent" design in `SPEC_FULL.md` §4.1 without the latency of a full message round-trip per
/// frame — acquire/release happen once per captured frame, on the hot path.
#[derive(Clone)]
pub struct FramePool(Arc<Inner>);

impl FramePool {
    /// `cap` is the hard limit on simultaneously-live buffers; exceeding it is a bug (leaked
    /// frames), not a resource to wait for, so `acquire` returns `StateInvariant` instead of
    /// blocking.
    pub fn new(cap: usize) -> Self {
        FramePool(Arc::new(Inner {
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            cap,
        }))
    }

    pub fn live_count(&self) -> usize {
        self.0.live.load(Ordering::Relaxed)
    }

    /// Acquires a buffer sized for `width * height` BGR pixels, zero-filled if newly allocated
    /// (recycled buffers keep their old contents until overwritten by the caller).
    pub fn acquire(&self, width: u32, height: u32, timestamp: SystemTime) -> Result<Frame, Error> {
        let want = width as usize * height as usize * BYTES_PER_PIXEL;
        let live = self.0.live.fetch_add(1, Ordering::AcqRel) + 1;
        if live > self.0.cap {
            self.0.live.fetch_sub(1, Ordering::AcqRel);
            bail!(StateInvariant, msg("frame pool exceeded cap of {} live buffers", self.0.cap));
        }
        let mut pixels = {
            let mut free = self.0.free.lock();
            free.pop().unwrap_or_default()
        };
        pixels.clear();
        pixels.resize(want, 0);
        Ok(Frame {
            pixels: Some(pixels),
            width,
            height,
            timestamp,
            pool: self.0.clone(),
        })
    }

    /// Drops all free buffers and refuses further acquires (used at shutdown so any frame that
    /// outlives the pool is released into the void instead of panicking on drop).
    pub fn shutdown(&self) {
        self.0.free.lock().clear();
    }
}

/// One owned, exclusive image buffer. Dropping a `Frame` returns its storage to the
/// [`FramePool`] it was acquired from.
pub struct Frame {
    pixels: Option<Vec<u8>>,
    width: u32,
    height: u32,
    pub timestamp: SystemTime,
    pool: Arc<Inner>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_deref().expect("pixels taken only on drop")
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.pixels.as_deref_mut().expect("pixels taken only on drop")
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Returns a new frame with the same dimensions and timestamp, copied from a fresh buffer in
    /// the given pool. Used by the pre-roll buffer, which must own independent copies of the
    /// frames it retains rather than aliasing the capture loop's handoff slot.
    pub fn clone_into(&self, pool: &FramePool) -> Result<Frame, Error> {
        let mut f = pool.acquire(self.width, self.height, self.timestamp)?;
        f.pixels_mut().copy_from_slice(self.pixels());
        Ok(f)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pixels) = self.pixels.take() {
            self.pool.live.fetch_sub(1, Ordering::AcqRel);
            self.pool.free.lock().push(pixels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_conservation() {
        let pool = FramePool::new(4);
        let now = SystemTime::now();
        let a = pool.acquire(2, 2, now).unwrap();
        let b = pool.acquire(2, 2, now).unwrap();
        assert_eq!(pool.live_count(), 2);
        drop(a);
        assert_eq!(pool.live_count(), 1);
        drop(b);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn over_cap_is_state_invariant() {
        let pool = FramePool::new(1);
        let now = SystemTime::now();
        let _a = pool.acquire(1, 1, now).unwrap();
        let e = pool.acquire(1, 1, now).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::StateInvariant);
        // A failed acquire doesn't leak a phantom live count.
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn released_buffer_is_recycled() {
        let pool = FramePool::new(4);
        let now = SystemTime::now();
        let a = pool.acquire(4, 4, now).unwrap();
        let ptr = a.pixels().as_ptr();
        drop(a);
        let b = pool.acquire(4, 4, now).unwrap();
        assert_eq!(b.pixels().as_ptr(), ptr, "should reuse the freed allocation");
    }

    #[test]
    fn clone_into_is_an_independent_copy() {
        let pool = FramePool::new(4);
        let mut a = pool.acquire(2, 1, SystemTime::now()).unwrap();
        a.pixels_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        let b = a.clone_into(&pool).unwrap();
        assert_eq!(b.pixels(), a.pixels());
        assert_ne!(b.pixels().as_ptr(), a.pixels().as_ptr());
    }
}
