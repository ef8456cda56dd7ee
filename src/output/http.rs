//! Replays captured requests against a destination over HTTP.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use reqwest::{Client, Method};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};
use url::Url;

use super::rate_limit::TokenBucket;
use super::{Overflow, TrafficSink, WriteOutcome};
use crate::config::HttpOutputConfig;
use crate::error::SinkError;
use crate::message::{CorrelationId, Message, MessageKind};

const MAX_HEADERS: usize = 128;

/// Connection-level headers that must not be forwarded.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A captured request split into the parts needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, Bytes)>,
    pub body: Bytes,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Parse a raw HTTP/1.x request. Chunked bodies are decoded.
pub fn parse_request(payload: &[u8]) -> Result<ParsedRequest, SinkError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let head_len = match request.parse(payload) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(SinkError::InvalidPayload("incomplete request head".into()))
        }
        Err(e) => return Err(SinkError::InvalidPayload(e.to_string())),
    };

    let method = request
        .method
        .ok_or_else(|| SinkError::InvalidPayload("missing method".into()))?
        .to_string();
    let target = request
        .path
        .ok_or_else(|| SinkError::InvalidPayload("missing request target".into()))?
        .to_string();
    let headers: Vec<(String, Bytes)> = request
        .headers
        .iter()
        .map(|h| (h.name.to_string(), Bytes::copy_from_slice(h.value)))
        .collect();

    let mut parsed = ParsedRequest {
        method,
        target,
        headers,
        body: Bytes::new(),
    };

    let raw_body = &payload[head_len..];
    let chunked = parsed
        .header("transfer-encoding")
        .map(|v| String::from_utf8_lossy(v).to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    parsed.body = if chunked {
        dechunk(raw_body)?
    } else if let Some(len) = parsed.header("content-length") {
        let len: usize = std::str::from_utf8(len)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| SinkError::InvalidPayload("invalid Content-Length".into()))?;
        // Captures may end early; replay whatever body was seen.
        Bytes::copy_from_slice(&raw_body[..len.min(raw_body.len())])
    } else {
        Bytes::copy_from_slice(raw_body)
    };

    Ok(parsed)
}

/// Decode a chunked transfer-coded body. Trailers are discarded.
fn dechunk(mut src: &[u8]) -> Result<Bytes, SinkError> {
    let mut body = BytesMut::new();
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(src) {
            Ok(httparse::Status::Complete(parts)) => parts,
            Ok(httparse::Status::Partial) => {
                return Err(SinkError::InvalidPayload("truncated chunked body".into()))
            }
            Err(_) => return Err(SinkError::InvalidPayload("invalid chunk size".into())),
        };
        src = &src[consumed..];
        if size == 0 {
            return Ok(body.freeze());
        }

        let size = usize::try_from(size)
            .map_err(|_| SinkError::InvalidPayload("chunk too large".into()))?;
        if src.len() < size + 2 {
            return Err(SinkError::InvalidPayload("truncated chunk".into()));
        }
        body.extend_from_slice(&src[..size]);
        src = &src[size + 2..];
    }
}

/// Resolve a request target against the destination base url, keeping any
/// path prefix the base carries.
pub(crate) fn target_url(base: &Url, target: &str) -> Result<Url, SinkError> {
    let (path, query) = if target.starts_with('/') {
        match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        }
    } else if target == "*" {
        ("/".to_string(), None)
    } else {
        // Absolute-form target as sent to a forward proxy.
        let absolute = Url::parse(target)
            .map_err(|e| SinkError::InvalidPayload(format!("invalid target {target}: {e}")))?;
        (
            absolute.path().to_string(),
            absolute.query().map(str::to_string),
        )
    };

    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{path}"));
    url.set_query(query.as_deref());
    Ok(url)
}

/// Decrements the pending counter when a write leaves the sink.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct HttpSink {
    name: String,
    base: Url,
    client: Client,
    config: HttpOutputConfig,
    stripped: HashSet<String>,
    overrides: HeaderMap,
    workers: Arc<Semaphore>,
    pending: AtomicUsize,
    rate_limiter: Option<TokenBucket>,
    /// Failed attempts per request still owed a retry. Retries were already
    /// admitted by the rate limiter once.
    retrying: DashMap<CorrelationId, u32>,
    feedback: Option<mpsc::Sender<Message>>,
}

impl HttpSink {
    pub fn new(
        config: HttpOutputConfig,
        feedback: Option<mpsc::Sender<Message>>,
    ) -> Result<Self, SinkError> {
        let base = Url::parse(&config.url)
            .map_err(|e| SinkError::Client(format!("invalid url {}: {e}", config.url)))?;

        let client = Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(config.workers)
            .build()
            .map_err(|e| SinkError::Client(e.to_string()))?;

        let mut stripped: HashSet<String> = HOP_BY_HOP.iter().map(|h| h.to_string()).collect();
        stripped.insert("content-length".to_string());
        stripped.extend(config.strip_headers.iter().map(|h| h.to_ascii_lowercase()));

        let mut overrides = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SinkError::Client(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SinkError::Client(format!("invalid header value for {name}: {e}")))?;
            overrides.insert(name, value);
        }

        let feedback = if config.track_responses { feedback } else { None };

        Ok(Self {
            name: format!("http:{}", config.url),
            base,
            client,
            stripped,
            overrides,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            pending: AtomicUsize::new(0),
            rate_limiter: config.rate_limit.map(TokenBucket::per_second),
            retrying: DashMap::new(),
            feedback,
            config,
        })
    }

    fn build_request(&self, message: &Message) -> Result<reqwest::Request, SinkError> {
        let parsed = parse_request(&message.payload)?;

        let method = Method::from_bytes(parsed.method.as_bytes())
            .map_err(|e| SinkError::InvalidPayload(format!("invalid method: {e}")))?;
        let url = target_url(&self.base, &parsed.target)?;

        let mut headers = HeaderMap::new();
        for (name, value) in &parsed.headers {
            let lower = name.to_ascii_lowercase();
            if self.stripped.contains(&lower) || (lower == "host" && !self.config.preserve_host) {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(lower.as_bytes()),
                HeaderValue::from_bytes(value),
            ) else {
                debug!(sink = %self.name, header = %name, "Skipping unrepresentable header");
                continue;
            };
            headers.append(name, value);
        }
        for (name, value) in &self.overrides {
            headers.insert(name.clone(), value.clone());
        }
        if !self.config.preserve_host && !self.overrides.contains_key(HOST) {
            headers.remove(HOST);
        }
        headers.remove(CONTENT_LENGTH);

        self.client
            .request(method, url)
            .headers(headers)
            .body(parsed.body)
            .build()
            .map_err(|e| SinkError::InvalidPayload(e.to_string()))
    }

    async fn attempt(&self, message: &Arc<Message>, is_retry: bool) -> WriteOutcome {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = PendingGuard(&self.pending);
        if pending > self.config.workers + self.config.queue_limit {
            return WriteOutcome::Dropped("queue limit reached".into());
        }

        if let Some(limiter) = &self.rate_limiter {
            if !is_retry && !limiter.try_acquire() {
                return WriteOutcome::Dropped("rate limit exceeded".into());
            }
        }

        let request = match self.build_request(message) {
            Ok(request) => request,
            Err(e) => return WriteOutcome::Dropped(e.to_string()),
        };

        let Ok(_permit) = self.workers.acquire().await else {
            return WriteOutcome::Dropped("sink closed".into());
        };

        match self.client.execute(request).await {
            Ok(response) => {
                debug!(
                    sink = %self.name,
                    correlation_id = %message.correlation_id,
                    status = response.status().as_u16(),
                    "Replayed request"
                );
                self.record_response(message, response).await;
                WriteOutcome::Delivered
            }
            Err(e) if e.is_timeout() => WriteOutcome::Retryable("request timed out".into()),
            Err(e) if e.is_connect() => WriteOutcome::Retryable(format!("connection failed: {e}")),
            Err(e) => WriteOutcome::Retryable(e.to_string()),
        }
    }

    async fn record_response(&self, message: &Message, response: reqwest::Response) {
        let Some(feedback) = &self.feedback else {
            return;
        };

        let status = response.status();
        let mut raw = BytesMut::new();
        raw.extend_from_slice(
            format!(
                "{:?} {} {}\r\n",
                response.version(),
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in response.headers() {
            raw.extend_from_slice(name.as_str().as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");

        match response.bytes().await {
            Ok(body) => raw.extend_from_slice(&body),
            Err(e) => {
                warn!(sink = %self.name, "Failed to read replayed response body: {}", e);
            }
        }

        let replayed = message.derive(MessageKind::ReplayedResponse, raw.freeze());
        if feedback.try_send(replayed).is_err() {
            warn!(
                sink = %self.name,
                correlation_id = %message.correlation_id,
                "Feedback channel full, replayed response dropped"
            );
        }
    }
}

#[async_trait]
impl TrafficSink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, message: Arc<Message>) -> WriteOutcome {
        let failures = self
            .retrying
            .remove(&message.correlation_id)
            .map_or(0, |(_, failures)| failures);

        let outcome = self.attempt(&message, failures > 0).await;
        if matches!(outcome, WriteOutcome::Retryable(_)) && failures + 1 < self.retry_budget() {
            self.retrying.insert(message.correlation_id, failures + 1);
        }
        outcome
    }

    fn accepts(&self, kind: MessageKind) -> bool {
        kind.is_request()
    }

    fn max_in_flight(&self) -> usize {
        self.config.workers + self.config.queue_limit
    }

    fn overflow(&self) -> Overflow {
        Overflow::Drop
    }

    fn retry_budget(&self) -> u32 {
        self.config.retry_budget.max(1)
    }

    async fn close(&self) {
        self.workers.close();
    }
}
