#![forbid(unsafe_code)]

// Per-peer media sessions: the transport state machine plus the producer and
// consumer sessions bound to it.

pub mod consumer;
pub mod producer;
pub mod transport;

pub use consumer::{ConsumerSession, ConsumerState};
pub use producer::{validate_rtp_parameters, ProducerSession};
pub use transport::{TransportSession, TransportState};

use crate::room::Room;
use std::sync::Arc;

/// Everything a successful join established for one peer. Replaced as a
/// whole on re-join and dropped on teardown; never mutated in place.
#[derive(Clone)]
pub struct PeerSession {
    pub peer_id: String,
    pub room: Arc<Room>,
    pub transport: Arc<TransportSession>,
}

impl PeerSession {
    pub fn room_id(&self) -> &str {
        self.room.id()
    }
}
