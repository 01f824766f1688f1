//! Turn orchestration: the Session Hub, the Turn Runner, and the runtime
//! plumbing between them.

pub mod runtime;

pub use runtime::{ActiveRun, CancelMap, SessionBroadcaster, SessionHub, StreamHandler, SubmitOutcome, TurnDeps, TurnInput};
