#![forbid(unsafe_code)]

// Room module - shared per-room state and the close cascades.
//
// All mutations of one room go through a single std mutex that is never held
// across an await. Engine calls happen before the lock is taken; the lock
// only installs or removes the resulting sessions and snapshots the
// recipients of fan-out messages.

pub mod registry;

pub use registry::{RoomRegistry, RoomRetention};

use crate::error::{SessionError, SessionResult};
use crate::events::{EventBus, RoomEvent};
use crate::media::{MediaKind, RouterHandle, RtpCapabilities};
use crate::session::{ConsumerSession, ProducerSession, TransportSession};
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound queue of one connected peer
pub type PeerSender = mpsc::Sender<ServerMessage>;

/// Queue a message for a peer without waiting. A full queue drops the
/// message; a closed queue means the peer is already gone.
pub fn deliver(sender: &PeerSender, peer_id: &str, message: ServerMessage) {
    match sender.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for peer {}, dropping message", peer_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for peer {} (disconnected)", peer_id);
        }
    }
}

struct PeerEntry {
    transport: Arc<TransportSession>,
    sender: PeerSender,
}

#[derive(Default)]
struct RoomState {
    /// At most one live producer per media kind
    producers: HashMap<MediaKind, Arc<ProducerSession>>,
    consumers: HashMap<String, Arc<ConsumerSession>>,
    peers: HashMap<String, PeerEntry>,
    retired: bool,
}

impl RoomState {
    fn transport_is_live(&self, peer_id: &str, transport: &Arc<TransportSession>) -> bool {
        !self.retired
            && !transport.is_closed()
            && self
                .peers
                .get(peer_id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.transport, transport))
    }

    fn active_producer(&self, producer_id: &str) -> Option<&Arc<ProducerSession>> {
        self.producers
            .values()
            .find(|p| p.id() == producer_id && !p.is_closed())
    }
}

/// Result of looking up a consumer id on behalf of a peer
pub enum ConsumerLookup {
    Own(Arc<ConsumerSession>),
    /// The id belongs to another peer's consumer
    Foreign,
    /// Never existed here, or already closed
    Unknown,
}

/// One room: its router, producer slot, consumers and joined peers
pub struct Room {
    id: String,
    router: Arc<dyn RouterHandle>,
    state: StdMutex<RoomState>,
    events: EventBus,
}

impl Room {
    pub(crate) fn new(id: String, router: Arc<dyn RouterHandle>, events: EventBus) -> Self {
        Self {
            id,
            router,
            state: StdMutex::new(RoomState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self) -> &dyn RouterHandle {
        self.router.as_ref()
    }

    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.router.rtp_capabilities()
    }

    pub fn is_retired(&self) -> bool {
        self.lock().retired
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn consumer_count(&self, peer_id: &str) -> usize {
        self.lock()
            .consumers
            .values()
            .filter(|c| c.peer_id() == peer_id)
            .count()
    }

    pub fn producer_ids(&self) -> Vec<String> {
        self.lock().producers.values().map(|p| p.id().to_string()).collect()
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        self.lock().consumers.keys().cloned().collect()
    }

    /// Adds a peer. `welcome` is queued to the newcomer first, followed by a
    /// new-producer for every active producer, so nothing published
    /// concurrently can overtake it. Returns false if the room was retired
    /// in the meantime.
    pub fn admit(
        &self,
        peer_id: &str,
        transport: Arc<TransportSession>,
        sender: PeerSender,
        welcome: ServerMessage,
    ) -> bool {
        let mut state = self.lock();
        if state.retired {
            return false;
        }

        deliver(&sender, peer_id, welcome);
        for producer in state.producers.values() {
            deliver(
                &sender,
                peer_id,
                ServerMessage::NewProducer {
                    producer_id: producer.id().to_string(),
                    kind: producer.kind(),
                },
            );
        }

        state
            .peers
            .insert(peer_id.to_string(), PeerEntry { transport, sender });
        let viewers = state.peers.len();
        drop(state);

        info!("Peer {} joined room {} ({} peers)", peer_id, self.id, viewers);
        self.events.publish(RoomEvent::PeerJoined {
            room_id: self.id.clone(),
            peer_id: peer_id.to_string(),
            viewers,
        });
        true
    }

    /// The producer with this id, if it is one of the room's active producers
    pub fn active_producer(&self, producer_id: &str) -> Option<Arc<ProducerSession>> {
        self.lock().active_producer(producer_id).cloned()
    }

    /// Installs a freshly created producer, replacing the previous producer
    /// of the same kind. The previous producer is closed and its dependents
    /// notified before anyone hears about the new one. Returns whether a
    /// producer was replaced.
    pub fn install_producer(
        &self,
        transport: &Arc<TransportSession>,
        producer: Arc<ProducerSession>,
    ) -> SessionResult<bool> {
        let peer_id = producer.peer_id();
        let mut state = self.lock();
        if !state.transport_is_live(peer_id, transport) {
            drop(state);
            producer.close();
            return Err(SessionError::State(format!(
                "transport {} closed before producer could be installed",
                transport.id()
            )));
        }

        let prior = state.producers.insert(producer.kind(), producer.clone());
        if let Some(prior) = &prior {
            info!(
                "Producer {} replaces {} ({}) in room {}",
                producer.id(),
                prior.id(),
                producer.kind(),
                self.id
            );
            self.cascade_producer(&mut state, prior, Some(peer_id));
        }

        for (id, entry) in &state.peers {
            if id != peer_id {
                deliver(
                    &entry.sender,
                    id,
                    ServerMessage::NewProducer {
                        producer_id: producer.id().to_string(),
                        kind: producer.kind(),
                    },
                );
            }
        }
        drop(state);

        self.events.publish(RoomEvent::ProducerOpened {
            room_id: self.id.clone(),
            peer_id: peer_id.to_string(),
            producer_id: producer.id().to_string(),
            kind: producer.kind(),
        });
        Ok(prior.is_some())
    }

    /// Installs a freshly created consumer if its transport and producer
    /// both survived the engine call
    pub fn install_consumer(
        &self,
        transport: &Arc<TransportSession>,
        consumer: Arc<ConsumerSession>,
        max_per_peer: usize,
    ) -> SessionResult<()> {
        let peer_id = consumer.peer_id();
        let mut state = self.lock();

        let rejection = if !state.transport_is_live(peer_id, transport) {
            Some(SessionError::State(format!(
                "transport {} closed before consumer could be installed",
                transport.id()
            )))
        } else if state.active_producer(consumer.producer_id()).is_none() {
            Some(SessionError::not_found("producer", consumer.producer_id()))
        } else if state.consumers.values().filter(|c| c.peer_id() == peer_id).count() >= max_per_peer {
            Some(SessionError::Validation(format!(
                "consumer limit of {max_per_peer} reached"
            )))
        } else {
            None
        };

        if let Some(err) = rejection {
            drop(state);
            consumer.close();
            return Err(err);
        }

        state
            .consumers
            .insert(consumer.id().to_string(), consumer.clone());
        debug!(
            "Consumer {} of peer {} installed for producer {} in room {}",
            consumer.id(),
            peer_id,
            consumer.producer_id(),
            self.id
        );
        Ok(())
    }

    pub fn find_consumer(&self, peer_id: &str, consumer_id: &str) -> ConsumerLookup {
        match self.lock().consumers.get(consumer_id) {
            Some(consumer) if consumer.peer_id() == peer_id => ConsumerLookup::Own(consumer.clone()),
            Some(_) => ConsumerLookup::Foreign,
            None => ConsumerLookup::Unknown,
        }
    }

    /// Closes one of the caller's own producers
    pub fn close_producer(&self, peer_id: &str, producer_id: &str) -> SessionResult<()> {
        let mut state = self.lock();
        let kind = state
            .producers
            .iter()
            .find(|(_, p)| p.id() == producer_id && p.peer_id() == peer_id)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| SessionError::not_found("producer", producer_id))?;

        if let Some(producer) = state.producers.remove(&kind) {
            self.cascade_producer(&mut state, &producer, Some(peer_id));
        }
        Ok(())
    }

    /// Removes a peer and cascades the close of its transport: its consumers
    /// are closed and removed, its producers leave the slot and their
    /// consumers are closed and notified. Returns the remaining peer count,
    /// or None if this transport was no longer the peer's current one.
    pub fn evict(&self, peer_id: &str, transport: &Arc<TransportSession>) -> Option<usize> {
        let mut state = self.lock();
        let is_current = state
            .peers
            .get(peer_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.transport, transport));
        if !is_current {
            drop(state);
            transport.close();
            return None;
        }

        state.peers.remove(peer_id);
        transport.close();

        let owned: Vec<String> = state
            .consumers
            .values()
            .filter(|c| c.transport_id() == transport.id())
            .map(|c| c.id().to_string())
            .collect();
        for id in &owned {
            if let Some(consumer) = state.consumers.remove(id) {
                consumer.close();
            }
        }

        let kinds: Vec<MediaKind> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id() == transport.id())
            .map(|(kind, _)| *kind)
            .collect();
        for kind in kinds {
            if let Some(producer) = state.producers.remove(&kind) {
                self.cascade_producer(&mut state, &producer, Some(peer_id));
            }
        }

        let viewers = state.peers.len();
        drop(state);

        info!(
            "Peer {} left room {} ({} consumers closed, {} peers remain)",
            peer_id,
            self.id,
            owned.len(),
            viewers
        );
        self.events.publish(RoomEvent::PeerLeft {
            room_id: self.id.clone(),
            peer_id: peer_id.to_string(),
            viewers,
        });
        Some(viewers)
    }

    /// Closes a producer that already left the slot, then closes, removes
    /// and reports every consumer fed by it. Peers other than `initiator`
    /// always hear about it; the initiator only when it lost consumers.
    fn cascade_producer(&self, state: &mut RoomState, producer: &Arc<ProducerSession>, initiator: Option<&str>) {
        producer.close();

        let dependents: Vec<Arc<ConsumerSession>> = state
            .consumers
            .values()
            .filter(|c| c.producer_id() == producer.id())
            .cloned()
            .collect();

        let mut closed_by_peer: HashMap<&str, Vec<String>> = HashMap::new();
        for consumer in &dependents {
            state.consumers.remove(consumer.id());
            consumer.close();
            closed_by_peer
                .entry(consumer.peer_id())
                .or_default()
                .push(consumer.id().to_string());
        }

        for (id, entry) in &state.peers {
            let consumer_ids = closed_by_peer.remove(id.as_str()).unwrap_or_default();
            if Some(id.as_str()) == initiator && consumer_ids.is_empty() {
                continue;
            }
            deliver(
                &entry.sender,
                id,
                ServerMessage::ProducerClosed {
                    producer_id: producer.id().to_string(),
                    consumer_ids,
                },
            );
        }

        debug!(
            "Producer {} closed in room {} with {} consumers",
            producer.id(),
            self.id,
            dependents.len()
        );
        self.events.publish(RoomEvent::ProducerClosed {
            room_id: self.id.clone(),
            producer_id: producer.id().to_string(),
            consumers_closed: dependents.len(),
        });
    }

    /// Retires the room if nobody is in it. Returns true when this call
    /// retired it.
    pub fn retire_if_empty(&self) -> bool {
        let mut state = self.lock();
        if state.retired || !state.peers.is_empty() {
            return false;
        }
        state.retired = true;
        drop(state);
        self.router.close();
        true
    }

    /// Engine death: every peer is told, then every session is closed
    pub fn fail(&self, reason: &str) -> usize {
        self.shutdown(reason, true)
    }

    /// Administrative close; remaining peers only see their transport close
    pub fn retire(&self, reason: &str) -> usize {
        self.shutdown(reason, false)
    }

    fn shutdown(&self, reason: &str, engine_failed: bool) -> usize {
        let mut state = self.lock();
        if state.retired && state.peers.is_empty() {
            return 0;
        }
        state.retired = true;

        let peers = std::mem::take(&mut state.peers);
        for (id, entry) in &peers {
            if engine_failed {
                deliver(
                    &entry.sender,
                    id,
                    ServerMessage::EngineFailed {
                        message: reason.to_string(),
                    },
                );
            }
            deliver(
                &entry.sender,
                id,
                ServerMessage::TransportClosed {
                    transport_id: entry.transport.id().to_string(),
                    reason: reason.to_string(),
                },
            );
            entry.transport.close();
        }
        for (_, consumer) in state.consumers.drain() {
            consumer.close();
        }
        for (_, producer) in state.producers.drain() {
            producer.close();
        }
        drop(state);

        self.router.close();
        info!("Room {} shut down ({} peers): {}", self.id, peers.len(), reason);
        peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::{DtlsFingerprint, DtlsParameters, DtlsRole, RtpCodecParameters};
    use crate::media::{LoopbackEngine, MediaEngine, RouterConfig, RtpParameters, TransportConfig};
    use std::time::Duration;

    struct TestPeer {
        id: String,
        transport: Arc<TransportSession>,
        rx: mpsc::Receiver<ServerMessage>,
    }

    async fn room() -> Room {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&RouterConfig::default_codecs()).await.unwrap();
        Room::new("R1".to_string(), router, EventBus::new())
    }

    async fn join(room: &Room, id: &str) -> TestPeer {
        let handle = room
            .router()
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let transport = Arc::new(TransportSession::new(id, room.id(), handle));
        transport
            .connect(
                DtlsParameters {
                    role: DtlsRole::Client,
                    fingerprints: vec![DtlsFingerprint {
                        algorithm: "sha-256".into(),
                        value: "00".into(),
                    }],
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        assert!(room.admit(id, transport.clone(), tx, ServerMessage::ack("join-room")));
        assert_eq!(rx.recv().await, Some(ServerMessage::ack("join-room")));
        TestPeer { id: id.to_string(), transport, rx }
    }

    fn video() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".into(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: Default::default(),
                rtcp_feedback: Vec::new(),
            }],
            extra: Default::default(),
        }
    }

    async fn produce(room: &Room, peer: &TestPeer) -> Arc<ProducerSession> {
        let handle = peer.transport.produce(MediaKind::Video, video()).await.unwrap();
        let producer = Arc::new(ProducerSession::new(handle, peer.transport.id(), &peer.id));
        room.install_producer(&peer.transport, producer.clone()).unwrap();
        producer
    }

    async fn consume(room: &Room, peer: &TestPeer, producer_id: &str) -> Arc<ConsumerSession> {
        let handle = peer
            .transport
            .consume(producer_id, room.rtp_capabilities())
            .await
            .unwrap();
        let consumer = Arc::new(ConsumerSession::new(handle, peer.transport.id(), &peer.id));
        room.install_consumer(&peer.transport, consumer.clone(), 16).unwrap();
        consumer
    }

    #[tokio::test]
    async fn test_evicting_publisher_cascades() {
        let room = room().await;
        let p1 = join(&room, "p1").await;
        let mut p2 = join(&room, "p2").await;

        let producer = produce(&room, &p1).await;
        assert!(matches!(p2.rx.recv().await, Some(ServerMessage::NewProducer { .. })));
        let consumer = consume(&room, &p2, producer.id()).await;

        assert_eq!(room.evict("p1", &p1.transport), Some(1));
        assert!(producer.is_closed());
        assert_eq!(consumer.state(), crate::session::ConsumerState::Closed);
        assert!(room.producer_ids().is_empty());
        assert!(room.consumer_ids().is_empty());
        assert_eq!(
            p2.rx.recv().await,
            Some(ServerMessage::ProducerClosed {
                producer_id: producer.id().to_string(),
                consumer_ids: vec![consumer.id().to_string()],
            })
        );
    }

    #[tokio::test]
    async fn test_consumer_needs_live_transport() {
        let room = room().await;
        let p1 = join(&room, "p1").await;
        let p2 = join(&room, "p2").await;
        let producer = produce(&room, &p1).await;

        let handle = p2
            .transport
            .consume(producer.id(), room.rtp_capabilities())
            .await
            .unwrap();
        let consumer = Arc::new(ConsumerSession::new(handle, p2.transport.id(), "p2"));
        room.evict("p2", &p2.transport);

        let err = room.install_consumer(&p2.transport, consumer.clone(), 16).unwrap_err();
        assert!(matches!(err, SessionError::State(_)));
        assert_eq!(consumer.state(), crate::session::ConsumerState::Closed);
    }

    #[tokio::test]
    async fn test_producer_needs_live_transport() {
        let room = room().await;
        let p1 = join(&room, "p1").await;
        let mut p2 = join(&room, "p2").await;

        let handle = p1.transport.produce(MediaKind::Video, video()).await.unwrap();
        let producer = Arc::new(ProducerSession::new(handle, p1.transport.id(), "p1"));
        assert_eq!(room.evict("p1", &p1.transport), Some(1));

        let err = room.install_producer(&p1.transport, producer.clone()).unwrap_err();
        assert!(matches!(err, SessionError::State(_)));
        assert!(producer.is_closed());
        assert!(room.active_producer(producer.id()).is_none());
        assert!(room.producer_ids().is_empty());
        assert!(!room.router().can_consume(producer.id(), &room.rtp_capabilities()));
        assert!(p2.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lookup_distinguishes_foreign_consumers() {
        let room = room().await;
        let p1 = join(&room, "p1").await;
        let p2 = join(&room, "p2").await;
        let producer = produce(&room, &p1).await;
        let consumer = consume(&room, &p2, producer.id()).await;

        assert!(matches!(room.find_consumer("p2", consumer.id()), ConsumerLookup::Own(_)));
        assert!(matches!(room.find_consumer("p1", consumer.id()), ConsumerLookup::Foreign));
        assert!(matches!(room.find_consumer("p2", "nope"), ConsumerLookup::Unknown));
    }

    #[tokio::test]
    async fn test_close_producer_requires_owner() {
        let room = room().await;
        let p1 = join(&room, "p1").await;
        let _p2 = join(&room, "p2").await;
        let producer = produce(&room, &p1).await;

        let err = room.close_producer("p2", producer.id()).unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
        room.close_producer("p1", producer.id()).unwrap();
        assert!(room.active_producer(producer.id()).is_none());
    }

    #[tokio::test]
    async fn test_retire_only_when_empty() {
        let room = room().await;
        let p1 = join(&room, "p1").await;
        assert!(!room.retire_if_empty());
        room.evict("p1", &p1.transport);
        assert!(room.retire_if_empty());
        assert!(!room.retire_if_empty());

        let handle = room.router().create_transport(&TransportConfig::default()).await;
        assert!(handle.is_err());
    }
}
