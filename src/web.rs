// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP(S) front end: one `hyper` 1.x server per configured bind address, all sharing the
//! same `Arc<AppState>`. Routing is a `match` on `(method, path)`, a boundary function rather than
//! a framework, mirroring the existing `Service::serve` shape. See `SPEC_FULL.md` §4.14 and §6.

use crate::body::{self, Body};
use crate::config::ConfigHandle;
use crate::mjpeg;
use crate::recorder;
use base::shutdown;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

pub struct AppState {
    pub config: ConfigHandle,
    pub store: store::Handle,
    pub recorder: recorder::Handle,
    pub mjpeg: mjpeg::Handle,
}

/// A response-building error that converts cleanly to a `Response<Body>`, the same role
/// `HttpError` plays in the code this is grounded on.
struct HttpError(Response<Body>);

impl From<base::Error> for HttpError {
    fn from(e: base::Error) -> Self {
        HttpError(from_base_error(e))
    }
}

type ResponseResult = Result<Response<Body>, HttpError>;

fn plain_response(status: StatusCode, text: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(body::full(text.into()))
        .expect("hardcoded response head is valid")
}

fn not_found(text: &'static str) -> HttpError {
    HttpError(plain_response(StatusCode::NOT_FOUND, text))
}

fn bad_req(text: impl Into<String>) -> HttpError {
    HttpError(plain_response(StatusCode::BAD_REQUEST, text))
}

fn from_base_error(e: base::Error) -> Response<Body> {
    use base::ErrorKind::*;
    let status = match e.kind() {
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        InvalidArgument | FailedPrecondition => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    plain_response(status, e.to_string())
}

fn serve_json<T: serde::Serialize>(out: &T) -> ResponseResult {
    let text = serde_json::to_vec(out).map_err(|e| {
        HttpError(plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    })?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(body::full(text))
        .expect("json response head is valid"))
}

/// Bearer-token check for the write endpoints (`/trigger`, `/delete`). Constant-time comparison
/// so response latency doesn't leak how many prefix bytes matched.
fn authenticate(req: &Request<Incoming>, expected: &Option<String>) -> Result<(), HttpError> {
    let Some(expected) = expected else {
        return Ok(()); // no token configured: endpoint is open, matching single-operator deployments.
    };
    let got = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let ok = match got {
        Some(got) => bool::from(got.as_bytes().ct_eq(expected.as_bytes())),
        None => false,
    };
    if ok {
        Ok(())
    } else {
        Err(HttpError(plain_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")))
    }
}

fn query_param<'a>(req: &'a Request<Incoming>, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

async fn serve_one(state: Arc<AppState>, req: Request<Incoming>) -> ResponseResult {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    debug!(%method, %path, "request");
    match (method, path.as_str()) {
        (Method::GET, "/healthz") => Ok(plain_response(StatusCode::OK, "ok")),
        (Method::GET, "/mjpeg") => mjpeg_stream(&state, &req).await,
        (Method::GET | Method::POST, "/trigger") => trigger(&state, &req).await,
        (Method::GET, "/events") => events(&state, &req).await,
        (Method::GET, "/eventsws") => events_ws(&state, req).await,
        (Method::GET, "/notifyws") => notify_ws(&state, req).await,
        (Method::GET, "/video") => artifact(&state, &req, store::video_path, "video/mp4").await,
        (Method::GET, "/thumb") => artifact(&state, &req, store::thumb_path, "image/jpeg").await,
        (Method::GET, "/vthumb") => artifact(&state, &req, store::vthumb_path, "video/mp4").await,
        (Method::POST, "/delete") => delete(&state, &req).await,
        _ => Err(not_found("no such endpoint")),
    }
}

async fn mjpeg_stream(state: &Arc<AppState>, req: &Request<Incoming>) -> ResponseResult {
    let Some(name) = query_param(req, "name") else {
        return Err(bad_req("missing required `name` query parameter"));
    };
    let resize = match (query_param(req, "width"), query_param(req, "height")) {
        (Some(w), Some(h)) => {
            let w: u32 = w.parse().map_err(|_| bad_req("bad `width`"))?;
            let h: u32 = h.parse().map_err(|_| bad_req("bad `height`"))?;
            Some((w, h))
        }
        _ => None,
    };
    let quality = query_param(req, "quality")
        .map(|q| q.parse::<u8>())
        .transpose()
        .map_err(|_| bad_req("bad `quality`"))?
        .unwrap_or(80);
    let max_fps = query_param(req, "fps")
        .map(|f| f.parse::<f64>())
        .transpose()
        .map_err(|_| bad_req("bad `fps`"))?;
    let opts = mjpeg::SessionOpts {
        resize,
        quality,
        max_fps,
    };
    let rx = state.mjpeg.subscribe(&name, opts).await;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_str(&mjpeg::content_type()).unwrap())
        .body(body::streaming(rx))
        .expect("mjpeg response head is valid"))
}

async fn trigger(state: &Arc<AppState>, req: &Request<Incoming>) -> ResponseResult {
    let config = state.config.current();
    authenticate(req, &config.bearer_token)?;
    state
        .recorder
        .motion(crate::motion::Event::MotionDetected)
        .await;
    Ok(plain_response(StatusCode::OK, "triggered"))
}

#[derive(serde::Serialize)]
struct EventJson {
    identifier: String,
    triggered_at_unix: u64,
    have_video: bool,
    have_thumb: bool,
    have_vthumb: bool,
    video_duration_sec: f64,
    size_bytes: u64,
    classification: Vec<(String, f32)>,
}

impl From<store::Record> for EventJson {
    fn from(r: store::Record) -> Self {
        let triggered_at_unix = r
            .triggered_at
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        EventJson {
            identifier: r.identifier,
            triggered_at_unix,
            have_video: r.have_video,
            have_thumb: r.have_thumb,
            have_vthumb: r.have_vthumb,
            video_duration_sec: r.video_duration_sec,
            size_bytes: r.size_bytes,
            classification: r.classification.sorted(),
        }
    }
}

async fn events(state: &Arc<AppState>, req: &Request<Incoming>) -> ResponseResult {
    let filter = store::ListFilter {
        have_classification: query_param(req, "have_classification").is_some(),
    };
    let records = state.store.list(filter).await?;
    let out: Vec<EventJson> = records.into_iter().map(EventJson::from).collect();
    serve_json(&out)
}

async fn artifact(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
    path_fn: fn(&std::path::Path, &str) -> std::path::PathBuf,
    content_type: &'static str,
) -> ResponseResult {
    let Some(identifier) = query_param(req, "id") else {
        return Err(bad_req("missing required `id` query parameter"));
    };
    if state.store.get(&identifier).await?.is_none() {
        return Err(not_found("no such record"));
    }
    let path = path_fn(state.store.base_dir(), &identifier);
    let file = std::fs::File::open(&path).map_err(|_| not_found("artifact not yet available"))?;
    let entity = http_serve::ChunkedReadFile::new(
        file,
        Some(base::clock::RealClocks {}),
        HeaderValue::from_static(content_type),
    )
    .map_err(|e| HttpError(plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())))?;
    let mut resp = http_serve::serve(entity, req);
    if query_param(req, "download").is_some() {
        resp.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename=\"{identifier}\""))
                .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
        );
    }
    Ok(resp.map(|b| b.map_err(|e| Box::new(e) as body::BoxError).boxed()))
}

async fn delete(state: &Arc<AppState>, req: &Request<Incoming>) -> ResponseResult {
    let config = state.config.current();
    authenticate(req, &config.bearer_token)?;
    let Some(identifier) = query_param(req, "id") else {
        return Err(bad_req("missing required `id` query parameter"));
    };
    state.store.delete(&identifier).await?;
    Ok(plain_response(StatusCode::OK, "deleted"))
}

/// Checks `Host`/`Origin` before an upgrade, the sole CSWSH protection for non-browser-agnostic
/// clients (browsers don't honor `SameSite` for WebSocket requests).
fn check_origin(req: &Request<Incoming>) -> Result<(), HttpError> {
    let Some(origin) = req.headers().get(header::ORIGIN) else {
        return Ok(());
    };
    let Some(host) = req.headers().get(header::HOST) else {
        return Err(bad_req("missing Host header"));
    };
    let host_str = host.to_str().map_err(|_| bad_req("bad Host header"))?;
    let host = host_str.split_once(':').map(|(h, _)| h).unwrap_or(host_str);
    let origin_str = origin.to_str().map_err(|_| bad_req("bad Origin header"))?;
    let origin_host = url::Url::parse(origin_str)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| bad_req("bad Origin header"))?;
    if host != origin_host {
        return Err(HttpError(plain_response(
            StatusCode::FORBIDDEN,
            "cross-origin request forbidden",
        )));
    }
    Ok(())
}

async fn events_ws(state: &Arc<AppState>, req: Request<Incoming>) -> ResponseResult {
    upgrade_and_fan_out(req, state.store.subscribe())
}

async fn notify_ws(state: &Arc<AppState>, req: Request<Incoming>) -> ResponseResult {
    let rx = state.recorder.subscribe_notifications().await;
    upgrade_and_fan_out(req, rx)
}

const WS_PING_INTERVAL: Duration = Duration::from_secs(10);
const WS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared upgrade mechanics for `/eventsws` and `/notifyws`: ping every 10s, a 10s write
/// deadline, and a literal `"update"` text frame whenever `rx` ticks (the payload itself is
/// discarded here — clients re-fetch state over the plain HTTP endpoints).
fn upgrade_and_fan_out<T: Clone + Send + 'static>(
    req: Request<Incoming>,
    rx: broadcast::Receiver<T>,
) -> ResponseResult {
    check_origin(&req)?;
    let response = tungstenite::handshake::server::create_response_with_body(&req, || ())
        .map_err(|e| bad_req(e.to_string()))?;
    let (parts, ()) = response.into_parts();
    tokio::spawn(run_update_socket(req, rx));
    Ok(Response::from_parts(parts, body::empty()))
}

async fn run_update_socket<T: Clone + Send + 'static>(
    req: Request<Incoming>,
    mut rx: broadcast::Receiver<T>,
) {
    let upgraded = match hyper::upgrade::on(req).await {
        Ok(u) => u,
        Err(e) => {
            warn!(%e, "websocket upgrade failed");
            return;
        }
    };
    let io = TokioIo::new(upgraded);
    let mut ws = WebSocketStream::from_raw_socket(io, tungstenite::protocol::Role::Server, None).await;
    loop {
        tokio::select! {
            changed = rx.recv() => {
                if changed.is_err() && matches!(changed, Err(broadcast::error::RecvError::Closed)) {
                    break;
                }
                let send = tokio::time::timeout(
                    WS_WRITE_TIMEOUT,
                    futures::SinkExt::send(&mut ws, tungstenite::Message::Text("update".into())),
                )
                .await;
                if !matches!(send, Ok(Ok(()))) {
                    break;
                }
            }
            _ = tokio::time::sleep(WS_PING_INTERVAL) => {
                let send = tokio::time::timeout(
                    WS_WRITE_TIMEOUT,
                    futures::SinkExt::send(&mut ws, tungstenite::Message::Ping(Vec::new().into())),
                )
                .await;
                if !matches!(send, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
    let _ = futures::SinkExt::close(&mut ws).await;
}

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds one listener and serves `state` on it until `shutdown` fires, then waits (up to
/// [`GRACEFUL_SHUTDOWN_TIMEOUT`]) for in-flight connections to finish on their own.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: shutdown::Receiver,
) -> Result<(), base::Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| base::err!(BindError, msg("binding {addr}: {e}")))?;
    info!(%addr, "web server listening");
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!(%e, "accept failed");
                    continue;
                }
            },
            _ = shutdown.as_future() => {
                info!(%addr, "web server shutting down");
                break;
            }
        };
        let state = state.clone();
        let io = TokioIo::new(stream);
        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
            let state = state.clone();
            async move { Ok::<_, Infallible>(serve_one(state, req).await.unwrap_or_else(|e| e.0)) }
        });
        let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service).with_upgrades();
        let conn = graceful.watch(conn);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%peer, %e, "connection error");
            }
        });
    }
    if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, graceful.shutdown())
        .await
        .is_err()
    {
        warn!(%addr, "timed out waiting for in-flight connections to finish");
    }
    Ok(())
}
