//! Bridge to an external filter/rewrite process.
//!
//! Messages are written to the child's stdin and read back from its stdout,
//! both using the wire framing. The child may drop, rewrite, duplicate or
//! inject messages; nothing pairs a send with a receive.

mod process;

pub use process::MiddlewareBridge;

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeState {
    Starting,
    Running,
    Closing,
    Closed,
    /// The process exited or a stream closed while running
    Failed,
}

impl BridgeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Closed | BridgeState::Failed)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Starting => "starting",
            BridgeState::Running => "running",
            BridgeState::Closing => "closing",
            BridgeState::Closed => "closed",
            BridgeState::Failed => "failed",
        };
        f.write_str(s)
    }
}
