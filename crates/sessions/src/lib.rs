//! Session state and event persistence.
//!
//! Session identity itself is an opaque string handed in by the caller;
//! mapping inbound channel/account/peer metadata onto that string is an
//! external collaborator's concern, not this crate's.

pub mod event_sink;
pub mod store;
pub mod transcript;

pub use event_sink::EventSink;
pub use store::{SessionEntry, SessionStore};
pub use transcript::TranscriptWriter;
