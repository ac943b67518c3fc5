#![forbid(unsafe_code)]

// Consumer session - one forwarded copy of a producer delivered to a peer.
// Starts paused and only flows after an explicit resume.

use crate::error::SessionResult;
use crate::media::{ConsumerHandle, MediaKind, RtpParameters};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    Active,
    Closed,
}

pub struct ConsumerSession {
    id: String,
    producer_id: String,
    transport_id: String,
    peer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    handle: Arc<dyn ConsumerHandle>,
    state: StdMutex<ConsumerState>,
}

impl ConsumerSession {
    pub fn new(handle: Arc<dyn ConsumerHandle>, transport_id: &str, peer_id: &str) -> Self {
        Self {
            id: handle.id().to_string(),
            producer_id: handle.producer_id().to_string(),
            transport_id: transport_id.to_string(),
            peer_id: peer_id.to_string(),
            kind: handle.kind(),
            rtp_parameters: handle.rtp_parameters(),
            handle,
            state: StdMutex::new(ConsumerState::Paused),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ConsumerState::Paused
    }

    /// Starts forwarding. Returns true only when this call flipped the
    /// consumer from paused to active; active and closed consumers are left
    /// alone without touching the engine.
    pub async fn resume(&self) -> SessionResult<bool> {
        if self.state() != ConsumerState::Paused {
            return Ok(false);
        }
        if let Err(e) = self.handle.resume().await {
            // Lost a race with the producer closing
            if self.state() == ConsumerState::Closed {
                return Ok(false);
            }
            return Err(e.into());
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ConsumerState::Paused {
            *state = ConsumerState::Active;
            debug!("Consumer {} of peer {} resumed", self.id, self.peer_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Mirror of [`resume`](Self::resume)
    pub async fn pause(&self) -> SessionResult<bool> {
        if self.state() != ConsumerState::Active {
            return Ok(false);
        }
        if let Err(e) = self.handle.pause().await {
            if self.state() == ConsumerState::Closed {
                return Ok(false);
            }
            return Err(e.into());
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ConsumerState::Active {
            *state = ConsumerState::Paused;
            debug!("Consumer {} of peer {} paused", self.id, self.peer_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Returns false if the consumer was already closed
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ConsumerState::Closed {
            return false;
        }
        *state = ConsumerState::Closed;
        drop(state);
        self.handle.close();
        true
    }
}
