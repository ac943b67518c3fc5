#![forbid(unsafe_code)]

// Producer session - one inbound stream published on a peer's transport

use crate::error::{SessionError, SessionResult};
use crate::media::{MediaKind, ProducerHandle, RtpParameters};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct ProducerSession {
    id: String,
    transport_id: String,
    peer_id: String,
    kind: MediaKind,
    handle: Arc<dyn ProducerHandle>,
    closed: AtomicBool,
}

impl ProducerSession {
    pub fn new(handle: Arc<dyn ProducerHandle>, transport_id: &str, peer_id: &str) -> Self {
        Self {
            id: handle.id().to_string(),
            transport_id: transport_id.to_string(),
            peer_id: peer_id.to_string(),
            kind: handle.kind(),
            handle,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
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

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the engine producer. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.handle.close();
        debug!("Producer {} ({}) of peer {} closed", self.id, self.kind, self.peer_id);
        true
    }
}

/// A produce request must carry at least one codec of the announced kind
pub fn validate_rtp_parameters(kind: MediaKind, rtp_parameters: &RtpParameters) -> SessionResult<()> {
    let prefix = kind.mime_prefix();
    let matches_kind = rtp_parameters
        .codecs
        .iter()
        .any(|codec| codec.mime_type.to_ascii_lowercase().starts_with(prefix));
    if matches_kind {
        Ok(())
    } else {
        Err(SessionError::Validation(format!(
            "rtpParameters carry no {kind} codec"
        )))
    }
}
