//! Everything that drives a live session: the in-memory run record, the
//! cancellation map, the event/broadcast translator, tool dispatch, the
//! turn loop itself, and the hub tying them all together.

pub mod active_run;
pub mod broadcaster;
pub mod cancel;
pub mod hub;
pub mod stream_handler;
pub mod tools;
pub mod turn;

pub use active_run::ActiveRun;
pub use broadcaster::SessionBroadcaster;
pub use cancel::CancelMap;
pub use hub::{SessionHub, SubmitOutcome};
pub use stream_handler::StreamHandler;
pub use turn::{TurnDeps, TurnInput};
