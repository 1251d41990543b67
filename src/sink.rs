// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The common consumer interface frames flow through: pre-roll flush, FPS normalization, and the
//! encoder sink all speak this one trait, so they compose by wrapping rather than by a bespoke
//! interface per stage.

use crate::frame::Frame;
use base::Error;

pub trait Sink {
    fn put(&mut self, frame: Frame) -> Result<(), Error>;
}

impl<F: FnMut(Frame) -> Result<(), Error>> Sink for F {
    fn put(&mut self, frame: Frame) -> Result<(), Error> {
        (self)(frame)
    }
}
