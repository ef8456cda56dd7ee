pub mod codec;
pub mod config;
pub mod emitter;
pub mod error;
pub mod input;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod output;
pub mod plugins;
pub mod web;

#[cfg(test)]
pub(crate) mod test_utils;

pub use emitter::{DispatchReport, Emitter, StopReason};
pub use error::{MirrorError, Result};
pub use message::{CorrelationId, Message, MessageKind};
pub use plugins::Plugins;
