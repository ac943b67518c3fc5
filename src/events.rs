#![forbid(unsafe_code)]

// Room event bus. Presence and persistence collaborators subscribe here
// instead of hooking into session internals.

use crate::media::MediaKind;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RoomEvent {
    #[serde(rename_all = "camelCase")]
    RoomCreated { room_id: String },
    #[serde(rename_all = "camelCase")]
    PeerJoined { room_id: String, peer_id: String, viewers: usize },
    #[serde(rename_all = "camelCase")]
    PeerLeft { room_id: String, peer_id: String, viewers: usize },
    #[serde(rename_all = "camelCase")]
    ProducerOpened {
        room_id: String,
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        room_id: String,
        producer_id: String,
        consumers_closed: usize,
    },
    #[serde(rename_all = "camelCase")]
    RoomReleased { room_id: String },
    #[serde(rename_all = "camelCase")]
    EngineFailed { reason: String },
}

/// Viewer count of a room, the only thing the presence channel needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub room_id: String,
    pub viewers: usize,
}

impl RoomEvent {
    pub fn room_id(&self) -> Option<&str> {
        match self {
            RoomEvent::RoomCreated { room_id }
            | RoomEvent::PeerJoined { room_id, .. }
            | RoomEvent::PeerLeft { room_id, .. }
            | RoomEvent::ProducerOpened { room_id, .. }
            | RoomEvent::ProducerClosed { room_id, .. }
            | RoomEvent::RoomReleased { room_id } => Some(room_id),
            RoomEvent::EngineFailed { .. } => None,
        }
    }

    pub fn presence(&self) -> Option<PresenceUpdate> {
        match self {
            RoomEvent::PeerJoined { room_id, viewers, .. } | RoomEvent::PeerLeft { room_id, viewers, .. } => {
                Some(PresenceUpdate {
                    room_id: room_id.clone(),
                    viewers: *viewers,
                })
            }
            RoomEvent::RoomReleased { room_id } => Some(PresenceUpdate {
                room_id: room_id.clone(),
                viewers: 0,
            }),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoomEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishing with no subscribers is not an error
    pub fn publish(&self, event: RoomEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }
}

/// Records every room event through tracing, keyed by room id, plus the
/// derived viewer count whenever membership changes
pub fn spawn_journal(bus: &EventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let room_id = event.room_id().unwrap_or("*");
                    match serde_json::to_string(&event) {
                        Ok(json) => info!(target: "roomcast::journal", room_id, "{}", json),
                        Err(e) => warn!("Failed to serialize room event: {}", e),
                    }
                    if let Some(presence) = event.presence() {
                        info!(
                            target: "roomcast::presence",
                            room_id = %presence.room_id,
                            viewers = presence.viewers,
                            "viewer count changed"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Session journal lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
