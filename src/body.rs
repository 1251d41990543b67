// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The one response body type every `web` handler returns, boxed so endpoints backed by very
//! different sources (a single JSON buffer, a chunked file, an indefinite MJPEG fan-out) share a
//! return type. See `SPEC_FULL.md` §4.14.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub type BoxError = Box<dyn StdError + Send + Sync>;
pub type Body = BoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn empty() -> Body {
    Empty::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Adapts an `mpsc::Receiver<Bytes>` (the MJPEG hub's per-client fan-out channel) into a body of
/// indefinite length: one `http_body::Frame::data` per received chunk, closing when the sender
/// side drops.
struct MpscBody(mpsc::Receiver<Bytes>);

impl http_body::Body for MpscBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        match self.get_mut().0.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(http_body::Frame::data(bytes)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub fn streaming(rx: mpsc::Receiver<Bytes>) -> Body {
    MpscBody(rx)
        .map_err(|never: Infallible| match never {})
        .boxed()
}
