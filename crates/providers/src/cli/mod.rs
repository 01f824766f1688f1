//! The CLI Stream Reader: runs a provider CLI as a subprocess under its own
//! process group and normalizes its stdout JSON lines into [`StreamEvent`]s.

pub mod cli_a;
pub mod cli_b;
pub mod cli_c;
pub mod registry;
pub mod spawn;

pub use registry::{ChildHandle, ChildRegistry};
pub use spawn::{read_cli_stream, CliFlavor, CliInvocation, CliOutcome, CliOutcomeHandle};

use cro_domain::stream::StreamEvent;

/// Per-flavor pure translation from one raw JSON line to zero or more
/// normalized events. Implementations carry whatever accumulator state
/// their flavor's wire format requires (e.g. tool-call id bookkeeping).
pub trait FlavorNormalizer: Send {
    fn normalize(&mut self, raw: serde_json::Value) -> Vec<StreamEvent>;

    /// A newly observed provider-native session id, if this line carried one.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// `(call_id, tool_name)` pairs for calls this normalizer has seen
    /// started but not yet resulted. Used to synthesize interrupted-tool
    /// results when the child is killed mid-call.
    fn active_tool_calls(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}
