use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub middleware: Option<MiddlewareConfig>,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputConfig {
    /// In-path HTTP tap in front of a production service
    #[serde(rename_all = "camelCase")]
    Capture {
        listen: String,
        upstream: String,
        #[serde(default = "default_capture_queue")]
        queue_size: usize,
        #[serde(default = "default_capture_max_body")]
        max_body_bytes: usize,
    },
    /// Replay of previously recorded frames
    #[serde(rename_all = "camelCase")]
    File {
        path: PathBuf,
        #[serde(default)]
        r#loop: bool,
        /// Timing multiplier: 1.0 keeps original pacing, 2.0 replays twice
        /// as fast, 0 disables pacing.
        #[serde(default)]
        speed: f64,
    },
    /// Socket accepting frames from remote forwarding sinks
    Tcp { address: String },
    Stdin,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutputConfig {
    Http(HttpOutputConfig),
    #[serde(rename_all = "camelCase")]
    File {
        path: PathBuf,
        /// fsync after every record
        #[serde(default)]
        sync: bool,
    },
    /// Accepts everything and does nothing
    Discard,
    #[serde(rename_all = "camelCase")]
    Tcp {
        address: String,
        #[serde(default = "default_retry_budget")]
        retry_budget: u32,
        /// Bound on connecting and on writing one frame
        #[serde(default = "default_tcp_timeout")]
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOutputConfig {
    pub url: String,
    #[serde(default = "default_http_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    #[serde(default = "default_http_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Requests per second; absent means unlimited
    #[serde(default)]
    pub rate_limit: Option<u64>,
    #[serde(default)]
    pub preserve_host: bool,
    #[serde(default)]
    pub strip_headers: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub track_responses: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Stop the pipeline when the middleware dies
    #[default]
    FailClosed,
    /// Keep running and send messages straight to the outputs
    FailOpen,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_middleware_queue")]
    pub queue_size: usize,
    #[serde(default = "default_middleware_stop_timeout")]
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitterConfig {
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Messages buffered per (producer, output) lane before dropping
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
    #[serde(default = "default_backoff_initial")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsConfig {
    /// Address for `/debug/vars` and `/metrics`; disabled when absent
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directive, e.g. `http_mirror=debug`
    #[serde(default)]
    pub filter: Option<String>,
}

// Default value functions
fn default_capture_queue() -> usize {
    10_000
}

fn default_capture_max_body() -> usize {
    10 * 1024 * 1024
}

fn default_http_workers() -> usize {
    num_cpus::get() * 2
}

fn default_queue_limit() -> usize {
    1000
}

fn default_http_timeout() -> u64 {
    5000
}

fn default_tcp_timeout() -> u64 {
    5000
}

fn default_retry_budget() -> u32 {
    3
}

fn default_middleware_queue() -> usize {
    1000
}

fn default_middleware_stop_timeout() -> u64 {
    2000
}

fn default_shutdown_grace() -> u64 {
    5000
}

fn default_lane_capacity() -> usize {
    1000
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    5000
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace(),
            lane_capacity: default_lane_capacity(),
            retry_backoff_ms: default_backoff_initial(),
            retry_backoff_max_ms: default_backoff_max(),
        }
    }
}

impl EmitterConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}

impl HttpOutputConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            workers: default_http_workers(),
            queue_limit: default_queue_limit(),
            timeout_ms: default_http_timeout(),
            retry_budget: default_retry_budget(),
            rate_limit: None,
            preserve_host: false,
            strip_headers: Vec::new(),
            headers: HashMap::new(),
            track_responses: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MiddlewareConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            on_failure: FailurePolicy::default(),
            queue_size: default_middleware_queue(),
            stop_timeout_ms: default_middleware_stop_timeout(),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl InputConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            InputConfig::Capture { .. } => "capture",
            InputConfig::File { .. } => "file",
            InputConfig::Tcp { .. } => "tcp",
            InputConfig::Stdin => "stdin",
        }
    }
}

impl OutputConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            OutputConfig::Http(_) => "http",
            OutputConfig::File { .. } => "file",
            OutputConfig::Discard => "discard",
            OutputConfig::Tcp { .. } => "tcp",
        }
    }
}
