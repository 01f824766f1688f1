//! The narrow surface the Stream Handler needs from the Session Hub: fan
//! out a message to every connection currently attached to a session.
//! Kept as a trait so `stream_handler` doesn't need to depend on the
//! concrete `SessionHub` type.

use cro_domain::protocol::ServerMessage;

pub trait SessionBroadcaster: Send + Sync {
    fn broadcast_to_session(&self, session_id: &str, message: ServerMessage);
}
