#![forbid(unsafe_code)]

// Transport session - per-peer state machine around one engine transport.
//
// Created -> Connecting -> Connected, and any state -> Closed. Engine calls
// happen outside the state lock; the lock only guards transitions.

use crate::error::{SessionError, SessionResult};
use crate::media::{
    ConsumerHandle, DtlsParameters, MediaError, MediaKind, ProducerHandle, RtpCapabilities,
    RtpParameters, TransportHandle, TransportInfo,
};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Created => "created",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: TransportState,
    remote_dtls_parameters: Option<DtlsParameters>,
}

pub struct TransportSession {
    peer_id: String,
    room_id: String,
    info: TransportInfo,
    handle: Arc<dyn TransportHandle>,
    inner: StdMutex<Inner>,
    closed: CancellationToken,
}

impl TransportSession {
    pub fn new(peer_id: &str, room_id: &str, handle: Arc<dyn TransportHandle>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            room_id: room_id.to_string(),
            info: handle.info(),
            handle,
            inner: StdMutex::new(Inner {
                state: TransportState::Created,
                remote_dtls_parameters: None,
            }),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Local ICE/DTLS description sent to the peer
    pub fn info(&self) -> &TransportInfo {
        &self.info
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    /// Fires once the transport is closed, whoever closed it
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed.child_token()
    }

    pub fn remote_dtls_parameters(&self) -> Option<DtlsParameters> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remote_dtls_parameters
            .clone()
    }

    fn begin_connect(&self, dtls_parameters: &DtlsParameters) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            TransportState::Created => {
                inner.state = TransportState::Connecting;
                inner.remote_dtls_parameters = Some(dtls_parameters.clone());
                Ok(())
            }
            state => Err(SessionError::State(format!(
                "transport {} cannot connect while {state}",
                self.info.id
            ))),
        }
    }

    fn finish_connect(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            TransportState::Connecting => {
                inner.state = TransportState::Connected;
                Ok(())
            }
            state => Err(SessionError::State(format!(
                "transport {} became {state} during handshake",
                self.info.id
            ))),
        }
    }

    /// Runs the DTLS handshake with the engine, bounded by `timeout`.
    /// On error the caller is expected to close the transport.
    pub async fn connect(&self, dtls_parameters: DtlsParameters, timeout: Duration) -> SessionResult<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(SessionError::Validation(
                "dtlsParameters.fingerprints must not be empty".to_string(),
            ));
        }
        self.begin_connect(&dtls_parameters)?;

        match tokio::time::timeout(timeout, self.handle.connect(dtls_parameters)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MediaError::Timeout {
                    operation: "transport connect",
                    after: timeout,
                }
                .into())
            }
        }

        self.finish_connect()?;
        info!(
            "Transport {} of peer {} connected in room {}",
            self.info.id, self.peer_id, self.room_id
        );
        Ok(())
    }

    pub fn ensure_connected(&self) -> SessionResult<()> {
        match self.state() {
            TransportState::Connected => Ok(()),
            state => Err(SessionError::State(format!(
                "transport {} is {state}, expected connected",
                self.info.id
            ))),
        }
    }

    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> SessionResult<Arc<dyn ProducerHandle>> {
        self.ensure_connected()?;
        Ok(self.handle.produce(kind, rtp_parameters).await?)
    }

    pub async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> SessionResult<Arc<dyn ConsumerHandle>> {
        self.ensure_connected()?;
        Ok(self.handle.consume(producer_id, rtp_capabilities).await?)
    }

    /// Moves to Closed and releases the engine transport. Returns false when
    /// the transport was already closed.
    pub fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.state == TransportState::Closed {
                return false;
            }
            inner.state = TransportState::Closed;
        }
        self.closed.cancel();
        self.handle.close();
        debug!(
            "Transport {} of peer {} in room {} closed",
            self.info.id, self.peer_id, self.room_id
        );
        true
    }
}
