//! Resolves configured inputs and outputs into live sources and sinks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{Config, InputConfig, MiddlewareConfig, OutputConfig};
use crate::error::Result;
use crate::input::{
    capture::CaptureOptions, CaptureSource, FileSource, StdinSource, TcpSource, TrafficSource,
};
use crate::message::Message;
use crate::metrics::Metrics;
use crate::output::{DiscardSink, FileSink, HttpSink, TcpSink, TrafficSink};

/// Replayed responses waiting to be fanned out again.
const FEEDBACK_QUEUE: usize = 1000;

/// Everything the emitter runs. Built once, then handed over whole.
#[derive(Default)]
pub struct Plugins {
    pub sources: Vec<Box<dyn TrafficSource>>,
    pub sinks: Vec<Arc<dyn TrafficSink>>,
    pub middleware: Option<MiddlewareConfig>,
    /// `ReplayedResponse` messages produced by HTTP sinks
    pub feedback: Option<mpsc::Receiver<Message>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl TrafficSource) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn with_sink(mut self, sink: impl TrafficSink) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn with_middleware(mut self, config: MiddlewareConfig) -> Self {
        self.middleware = Some(config);
        self
    }

    /// Open every configured input and output. Fails on the first one that
    /// cannot be opened.
    pub async fn from_config(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let mut plugins = Plugins::new();

        for input in &config.inputs {
            let source: Box<dyn TrafficSource> = match input {
                InputConfig::Capture {
                    listen,
                    upstream,
                    queue_size,
                    max_body_bytes,
                } => Box::new(
                    CaptureSource::bind(
                        CaptureOptions {
                            listen: listen.clone(),
                            upstream: upstream.clone(),
                            queue_size: *queue_size,
                            max_body_bytes: *max_body_bytes,
                        },
                        metrics.clone(),
                    )
                    .await?,
                ),
                InputConfig::File { path, r#loop, speed } => {
                    Box::new(FileSource::open(path, *r#loop, *speed, metrics.clone()).await?)
                }
                InputConfig::Tcp { address } => {
                    Box::new(TcpSource::bind(address, metrics.clone()).await?)
                }
                InputConfig::Stdin => Box::new(StdinSource::new(metrics.clone())),
            };
            info!(input = input.kind(), name = source.name(), "Input ready");
            plugins.sources.push(source);
        }

        let tracks_responses = config
            .outputs
            .iter()
            .any(|o| matches!(o, OutputConfig::Http(http) if http.track_responses));
        let feedback_tx = if tracks_responses {
            let (tx, rx) = mpsc::channel(FEEDBACK_QUEUE);
            plugins.feedback = Some(rx);
            Some(tx)
        } else {
            None
        };

        for output in &config.outputs {
            let sink: Arc<dyn TrafficSink> = match output {
                OutputConfig::Http(http) => {
                    Arc::new(HttpSink::new(http.clone(), feedback_tx.clone())?)
                }
                OutputConfig::File { path, sync } => Arc::new(FileSink::open(path, *sync).await?),
                OutputConfig::Discard => Arc::new(DiscardSink::new()),
                OutputConfig::Tcp {
                    address,
                    retry_budget,
                    timeout_ms,
                } => Arc::new(TcpSink::new(
                    address.clone(),
                    *retry_budget,
                    Duration::from_millis(*timeout_ms),
                )),
            };
            info!(output = output.kind(), name = sink.name(), "Output ready");
            plugins.sinks.push(sink);
        }

        plugins.middleware = config.middleware.clone();
        Ok(plugins)
    }
}
