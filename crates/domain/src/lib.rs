pub mod cancel;
pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod redact;
pub mod stream;
pub mod tool;
pub mod trace;

pub use cancel::CancelToken;
pub use capability::{LlmCapabilities, ToolSupport};
pub use config::{AgentConfig, ChatAgentConfig, Config, ProviderKind, ToolPolicy};
pub use error::{OrchestratorError, Result};
pub use event::{ChatEvent, ChatEventPayload, TurnTrigger};
pub use protocol::{ConnectionHandle, ErrorFrame, ServerMessage};
pub use stream::{BoxStream, StreamEvent, Usage};
pub use tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
pub use trace::TraceEvent;
