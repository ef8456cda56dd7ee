use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Middleware error: {0}")]
    Middleware(#[from] MiddlewareError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("All {0} sources failed")]
    AllSourcesFailed(usize),

    #[error("Emitter has already been started")]
    AlreadyRunning,

    #[error("Server error: {0}")]
    Server(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid frame header: {0}")]
    InvalidHeader(String),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(String),

    #[error("Missing frame delimiter")]
    MissingDelimiter,

    #[error("Frame exceeds maximum size of {0} bytes")]
    FrameTooLarge(usize),

    #[error("Truncated frame at end of input")]
    Truncated,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open source {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("Read failed on source {name}: {reason}")]
    Read { name: String, reason: String },

    #[error("Source {0} closed")]
    Closed(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to open sink {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("Invalid HTTP payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Error, Debug)]
pub enum MiddlewareError {
    #[error("Failed to spawn middleware: {0}")]
    SpawnFailed(String),

    #[error("Middleware is not running (state: {0:?})")]
    NotRunning(crate::middleware::BridgeState),

    #[error("Middleware stream closed: {0}")]
    StreamClosed(String),

    #[error("Middleware process exited: {0}")]
    Exited(String),

    #[error("Middleware inbound stream already taken")]
    ReceiverTaken,
}

pub type Result<T> = std::result::Result<T, MirrorError>;
