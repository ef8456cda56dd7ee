//! Live capture as an in-path HTTP tap.
//!
//! The tap sits in front of a production service: every request is forwarded
//! to the upstream unchanged and the upstream's answer is returned to the
//! client. Copies of both are queued for the pipeline without ever waiting on
//! it, so a slow pipeline costs captured messages, never production latency.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use warp::http::{HeaderMap, Method, StatusCode};
use warp::hyper::Body;
use warp::Filter;

use super::TrafficSource;
use crate::error::SourceError;
use crate::message::{CorrelationId, Message, MessageKind};
use crate::metrics::Metrics;
use crate::output::http::{target_url, HOP_BY_HOP};

/// Options for [`CaptureSource::bind`].
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub listen: String,
    pub upstream: String,
    pub queue_size: usize,
    pub max_body_bytes: usize,
}

struct Tap {
    name: String,
    client: Client,
    upstream: Url,
    tx: mpsc::Sender<Message>,
    metrics: Arc<Metrics>,
    max_body_bytes: usize,
}

impl Tap {
    /// Queue a captured message without waiting; overflow is counted.
    fn emit(&self, message: Message) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.metrics.capture_dropped.inc();
                debug!(
                    source = %self.name,
                    correlation_id = %message.correlation_id,
                    "Capture queue full, message dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn capture(&self, kind: MessageKind, id: CorrelationId, timestamp: u64, raw: Bytes, body_len: usize) {
        if body_len > self.max_body_bytes {
            self.metrics.capture_dropped.inc();
            debug!(source = %self.name, body_len, "Body over capture limit, not recorded");
            return;
        }
        self.emit(Message::new(kind, id, timestamp, raw));
    }
}

/// Render an HTTP/1.1 message from its parts. The body is already decoded,
/// so transfer codings are dropped and the length is stated explicitly.
fn render<'a>(
    start_line: &str,
    headers: impl Iterator<Item = (&'a str, &'a [u8])>,
    body: &[u8],
    always_length: bool,
) -> Bytes {
    let mut raw = BytesMut::with_capacity(start_line.len() + body.len() + 256);
    raw.extend_from_slice(start_line.as_bytes());
    raw.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value);
        raw.extend_from_slice(b"\r\n");
    }
    if always_length || !body.is_empty() {
        raw.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);
    raw.freeze()
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn bad_gateway() -> warp::reply::Response {
    let mut response = warp::reply::Response::new(Body::from("upstream unavailable"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

async fn handle(
    method: Method,
    target: String,
    headers: HeaderMap,
    body: Bytes,
    tap: Arc<Tap>,
) -> Result<warp::reply::Response, Infallible> {
    let id = CorrelationId::new();
    let received_at = crate::message::now_nanos();

    let raw_request = render(
        &format!("{method} {target} HTTP/1.1"),
        headers.iter().map(|(n, v)| (n.as_str(), v.as_bytes())),
        &body,
        false,
    );
    tap.capture(MessageKind::RequestCaptured, id, received_at, raw_request, body.len());

    let Ok(url) = target_url(&tap.upstream, &target) else {
        return Ok(bad_gateway());
    };
    let Ok(upstream_method) = reqwest::Method::from_bytes(method.as_str().as_bytes()) else {
        return Ok(bad_gateway());
    };

    let mut request = tap.client.request(upstream_method, url).body(body);
    for (name, value) in headers.iter() {
        let name = name.as_str();
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        request = request.header(name, value.as_bytes());
    }

    let upstream_response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(source = %tap.name, correlation_id = %id, "Upstream request failed: {}", e);
            return Ok(bad_gateway());
        }
    };

    let status = upstream_response.status().as_u16();
    let reason = upstream_response
        .status()
        .canonical_reason()
        .unwrap_or("")
        .to_string();
    let upstream_headers = upstream_response.headers().clone();
    let upstream_body = match upstream_response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(source = %tap.name, correlation_id = %id, "Upstream body failed: {}", e);
            return Ok(bad_gateway());
        }
    };

    let raw_response = render(
        &format!("HTTP/1.1 {status} {reason}"),
        upstream_headers
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_bytes())),
        &upstream_body,
        true,
    );
    tap.capture(
        MessageKind::ResponseCaptured,
        id,
        crate::message::now_nanos(),
        raw_response,
        upstream_body.len(),
    );

    let mut response = warp::reply::Response::new(Body::from(upstream_body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            warp::http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            warp::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    Ok(response)
}

fn routes(
    tap: Arc<Tap>,
) -> impl Filter<Extract = (warp::reply::Response,), Error = warp::Rejection> + Clone {
    let target = warp::path::full()
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .map(|path: warp::path::FullPath, query: String| {
            if query.is_empty() {
                path.as_str().to_string()
            } else {
                format!("{}?{}", path.as_str(), query)
            }
        });

    warp::method()
        .and(target)
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(warp::any().map(move || tap.clone()))
        .and_then(handle)
}

pub struct CaptureSource {
    name: String,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
}

impl CaptureSource {
    pub async fn bind(options: CaptureOptions, metrics: Arc<Metrics>) -> Result<Self, SourceError> {
        let name = format!("capture:{}", options.listen);
        let open_error = |reason: String| SourceError::Open {
            name: name.clone(),
            reason,
        };

        let upstream = Url::parse(&options.upstream).map_err(|e| open_error(e.to_string()))?;
        let listen: SocketAddr = options
            .listen
            .parse()
            .map_err(|e: std::net::AddrParseError| open_error(e.to_string()))?;
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| open_error(e.to_string()))?;

        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let tap = Arc::new(Tap {
            name: name.clone(),
            client,
            upstream,
            tx,
            metrics,
            max_body_bytes: options.max_body_bytes,
        });

        let shutdown = CancellationToken::new();
        let (local_addr, server) = warp::serve(routes(tap))
            .try_bind_with_graceful_shutdown(listen, shutdown.clone().cancelled_owned())
            .map_err(|e| open_error(e.to_string()))?;
        tokio::spawn(server);

        info!(source = %name, %local_addr, upstream = %options.upstream, "Capture tap listening");

        Ok(Self {
            name,
            local_addr,
            rx,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TrafficSource for CaptureSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        match self.rx.recv().await {
            Some(message) => Ok(Some(message)),
            None => Err(SourceError::Closed(self.name.clone())),
        }
    }
}
