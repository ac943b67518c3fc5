#![forbid(unsafe_code)]

// Signaling gateway - transport-independent request dispatcher.
//
// One `PeerContext` per connection; requests of a peer are handled strictly
// in order by the caller. Replies and events all travel through the peer's
// outbound queue so their relative order is preserved.

use super::protocol::{ClientMessage, DecodeError, ServerMessage};
use crate::config::GatewayConfig;
use crate::error::{SessionError, SessionResult};
use crate::media::{DtlsParameters, MediaError, MediaKind, RtpCapabilities, RtpParameters};
use crate::metrics::{Counter, ServerMetrics};
use crate::negotiation::Negotiator;
use crate::room::{deliver, ConsumerLookup, PeerSender, RoomRegistry};
use crate::session::{validate_rtp_parameters, ConsumerSession, PeerSession, ProducerSession, TransportSession, TransportState};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_ROOM_ID_CHARS: usize = 128;

/// Per-connection state threaded through the dispatch path
pub struct PeerContext {
    peer_id: String,
    sender: PeerSender,
    session: Option<PeerSession>,
    handshake_deadline: Option<Instant>,
}

impl PeerContext {
    pub fn new(peer_id: String, sender: PeerSender) -> Self {
        Self {
            peer_id,
            sender,
            session: None,
            handshake_deadline: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }

    /// When the joined transport must be connected by
    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    /// Fires when the joined transport closes, including from the room side
    pub fn transport_closed(&self) -> Option<CancellationToken> {
        self.session.as_ref().map(|s| s.transport.closed_signal())
    }

    fn send(&self, message: ServerMessage) {
        deliver(&self.sender, &self.peer_id, message);
    }

    fn require_session(&self) -> SessionResult<&PeerSession> {
        self.session
            .as_ref()
            .ok_or_else(|| SessionError::State("join a room first".to_string()))
    }
}

#[derive(Clone)]
pub struct SignalingGateway {
    registry: Arc<RoomRegistry>,
    config: GatewayConfig,
    metrics: ServerMetrics,
}

impl SignalingGateway {
    pub fn new(registry: Arc<RoomRegistry>, config: GatewayConfig, metrics: ServerMetrics) -> Self {
        Self {
            registry,
            config,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Handles one request and queues its reply, or a structured error
    pub async fn handle(&self, ctx: &mut PeerContext, message: ClientMessage) {
        let request = message.request_type();
        let started = StdInstant::now();

        match self.dispatch(ctx, message).await {
            Ok(Some(reply)) => ctx.send(reply),
            Ok(None) => {}
            Err(err) => self.fail_request(ctx, request, err),
        }

        self.metrics.observe_request(request, started.elapsed());
    }

    /// Reports a frame that could not be decoded
    pub fn reject(&self, ctx: &PeerContext, error: DecodeError) {
        self.metrics.inc(Counter::Errors);
        debug!("Rejected frame from peer {}: {}", ctx.peer_id, error.error);
        ctx.send(ServerMessage::error(error.request.as_deref(), &error.error));
    }

    fn fail_request(&self, ctx: &mut PeerContext, request: &str, err: SessionError) {
        self.metrics.inc(Counter::Errors);
        ctx.send(ServerMessage::error(Some(request), &err));

        match &err {
            SessionError::Engine(media) if media.is_engine_wide() => {
                warn!("Peer {} hit a dead media engine during {}: {}", ctx.peer_id, request, err);
                let engine_down = !self.registry.engine().status().borrow().is_running();
                if engine_down {
                    self.registry.fail_all(&media.to_string());
                }
                ctx.session = None;
                ctx.handshake_deadline = None;
            }
            SessionError::Engine(media) => {
                if matches!(media, MediaError::Timeout { .. }) {
                    self.metrics.inc(Counter::HandshakeTimeouts);
                }
                warn!("Engine error for peer {} during {}: {}", ctx.peer_id, request, err);
                self.teardown(ctx, &err.to_string(), true);
            }
            _ => debug!("Request {} from peer {} failed: {}", request, ctx.peer_id, err),
        }
    }

    async fn dispatch(&self, ctx: &mut PeerContext, message: ClientMessage) -> SessionResult<Option<ServerMessage>> {
        match message {
            ClientMessage::JoinRoom { room_id } => {
                self.join_room(ctx, &room_id).await?;
                Ok(None)
            }
            ClientMessage::ConnectTransport { dtls_parameters } => {
                self.connect_transport(ctx, dtls_parameters).await?;
                Ok(Some(ServerMessage::ack("connect-transport")))
            }
            ClientMessage::Produce { kind, rtp_parameters } => {
                let producer_id = self.produce(ctx, kind, rtp_parameters).await?;
                Ok(Some(ServerMessage::ProducerCreated { producer_id }))
            }
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let consumer = self.consume(ctx, &producer_id, rtp_capabilities).await?;
                Ok(Some(ServerMessage::ConsumerCreated {
                    consumer_id: consumer.id().to_string(),
                    producer_id: consumer.producer_id().to_string(),
                    kind: consumer.kind(),
                    rtp_parameters: consumer.rtp_parameters().clone(),
                }))
            }
            ClientMessage::ResumeConsumer { consumer_id } => {
                self.resume_consumer(ctx, &consumer_id).await?;
                Ok(Some(ServerMessage::ack("resume-consumer")))
            }
            ClientMessage::PauseConsumer { consumer_id } => {
                self.pause_consumer(ctx, &consumer_id).await?;
                Ok(Some(ServerMessage::ack("pause-consumer")))
            }
            ClientMessage::CloseProducer { producer_id } => {
                let session = ctx.require_session()?;
                session.transport.ensure_connected()?;
                session.room.close_producer(&ctx.peer_id, &producer_id)?;
                info!("Peer {} closed producer {}", ctx.peer_id, producer_id);
                Ok(Some(ServerMessage::ack("close-producer")))
            }
            ClientMessage::LeaveRoom => {
                self.teardown(ctx, "left room", false);
                Ok(Some(ServerMessage::ack("leave-room")))
            }
        }
    }

    async fn join_room(&self, ctx: &mut PeerContext, room_id: &str) -> SessionResult<()> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(SessionError::Validation("roomId must not be empty".to_string()));
        }
        if room_id.chars().count() > MAX_ROOM_ID_CHARS {
            return Err(SessionError::Validation(format!(
                "roomId exceeds {MAX_ROOM_ID_CHARS} characters"
            )));
        }

        // A re-join replaces the previous session as a whole
        self.teardown(ctx, "rejoined", false);

        let timeout = self.config.handshake_timeout;
        let allocate = async {
            loop {
                let room = self.registry.get_or_create(room_id).await?;
                let handle = match room.router().create_transport(&self.config.transport).await {
                    Ok(handle) => handle,
                    Err(MediaError::Closed(what)) if room.is_retired() => {
                        debug!("Room {} released while allocating ({} closed), retrying", room_id, what);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let transport = Arc::new(TransportSession::new(&ctx.peer_id, room_id, handle));
                let info = transport.info();
                let welcome = ServerMessage::TransportCreated {
                    transport_id: info.id.clone(),
                    ice_parameters: info.ice_parameters.clone(),
                    ice_candidates: info.ice_candidates.clone(),
                    dtls_parameters: info.dtls_parameters.clone(),
                    router_capabilities: room.rtp_capabilities(),
                };
                if room.admit(&ctx.peer_id, transport.clone(), ctx.sender.clone(), welcome) {
                    return Ok::<_, SessionError>((room, transport));
                }
                // Room was released under us; retry against a fresh one
                transport.close();
            }
        };

        let (room, transport) = tokio::time::timeout(timeout, allocate)
            .await
            .map_err(|_| MediaError::Timeout {
                operation: "join",
                after: timeout,
            })??;

        info!(
            "Peer {} joined room {} with transport {}",
            ctx.peer_id,
            room.id(),
            transport.id()
        );
        self.metrics.inc(Counter::Joins);
        ctx.session = Some(PeerSession {
            peer_id: ctx.peer_id.clone(),
            room,
            transport,
        });
        ctx.handshake_deadline = Some(Instant::now() + timeout);
        Ok(())
    }

    async fn connect_transport(&self, ctx: &mut PeerContext, dtls_parameters: DtlsParameters) -> SessionResult<()> {
        let session = ctx.require_session()?;
        session
            .transport
            .connect(dtls_parameters, self.config.handshake_timeout)
            .await?;
        ctx.handshake_deadline = None;
        Ok(())
    }

    async fn produce(&self, ctx: &PeerContext, kind: MediaKind, rtp_parameters: RtpParameters) -> SessionResult<String> {
        let session = ctx.require_session()?;
        session.transport.ensure_connected()?;
        validate_rtp_parameters(kind, &rtp_parameters)?;

        let handle = session.transport.produce(kind, rtp_parameters).await?;
        let producer = Arc::new(ProducerSession::new(handle, session.transport.id(), &ctx.peer_id));

        let replaced = session.room.install_producer(&session.transport, producer.clone())?;
        self.metrics.inc(Counter::ProducersCreated);
        if replaced {
            self.metrics.inc(Counter::ProducersReplaced);
        }
        info!(
            "Peer {} produces {} as {} in room {}",
            ctx.peer_id,
            kind,
            producer.id(),
            session.room.id()
        );
        Ok(producer.id().to_string())
    }

    async fn consume(
        &self,
        ctx: &PeerContext,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> SessionResult<Arc<ConsumerSession>> {
        let session = ctx.require_session()?;
        session.transport.ensure_connected()?;

        let producer = session
            .room
            .active_producer(producer_id)
            .ok_or_else(|| SessionError::not_found("producer", producer_id))?;
        Negotiator::new(session.room.router()).check(&producer, &rtp_capabilities)?;

        let max = self.config.max_consumers_per_peer;
        if session.room.consumer_count(&ctx.peer_id) >= max {
            return Err(SessionError::Validation(format!("consumer limit of {max} reached")));
        }

        let handle = match session.transport.consume(producer_id, rtp_capabilities).await {
            Ok(handle) => handle,
            // The producer closing mid-call is not the transport's fault
            Err(SessionError::Engine(_)) if producer.is_closed() => {
                return Err(SessionError::not_found("producer", producer_id));
            }
            Err(e) => return Err(e),
        };
        let consumer = Arc::new(ConsumerSession::new(handle, session.transport.id(), &ctx.peer_id));
        session.room.install_consumer(&session.transport, consumer.clone(), max)?;

        self.metrics.inc(Counter::ConsumersCreated);
        debug!(
            "Peer {} consumes producer {} as {} (paused)",
            ctx.peer_id,
            producer_id,
            consumer.id()
        );
        Ok(consumer)
    }

    fn own_consumer(&self, session: &PeerSession, consumer_id: &str) -> SessionResult<Option<Arc<ConsumerSession>>> {
        match session.room.find_consumer(&session.peer_id, consumer_id) {
            ConsumerLookup::Own(consumer) => Ok(Some(consumer)),
            ConsumerLookup::Foreign => Err(SessionError::not_found("consumer", consumer_id)),
            ConsumerLookup::Unknown => Ok(None),
        }
    }

    async fn resume_consumer(&self, ctx: &PeerContext, consumer_id: &str) -> SessionResult<()> {
        let session = ctx.require_session()?;
        session.transport.ensure_connected()?;
        if let Some(consumer) = self.own_consumer(session, consumer_id)? {
            if consumer.resume().await? {
                self.metrics.inc(Counter::ConsumersResumed);
            }
        }
        Ok(())
    }

    async fn pause_consumer(&self, ctx: &PeerContext, consumer_id: &str) -> SessionResult<()> {
        let session = ctx.require_session()?;
        session.transport.ensure_connected()?;
        if let Some(consumer) = self.own_consumer(session, consumer_id)? {
            consumer.pause().await?;
        }
        Ok(())
    }

    /// Closes the peer's transport with the full cascade and forgets the session
    fn teardown(&self, ctx: &mut PeerContext, reason: &str, notify: bool) {
        ctx.handshake_deadline = None;
        let Some(session) = ctx.session.take() else {
            return;
        };

        let was_open = !session.transport.is_closed();
        session.room.evict(&ctx.peer_id, &session.transport);
        if notify && was_open {
            ctx.send(ServerMessage::TransportClosed {
                transport_id: session.transport.id().to_string(),
                reason: reason.to_string(),
            });
        }
        if was_open {
            self.metrics.inc(Counter::Leaves);
        }
        self.registry.release_if_empty(&session.room);
        debug!("Peer {} session in room {} torn down: {}", ctx.peer_id, session.room.id(), reason);
    }

    /// Called when the handshake deadline passes. Tears the transport down
    /// unless it got connected in time.
    pub fn expire_handshake(&self, ctx: &mut PeerContext) -> bool {
        ctx.handshake_deadline = None;
        let pending = ctx
            .session
            .as_ref()
            .is_some_and(|s| !matches!(s.transport.state(), TransportState::Connected | TransportState::Closed));
        if pending {
            warn!("Peer {} did not complete the transport handshake in time", ctx.peer_id);
            self.metrics.inc(Counter::HandshakeTimeouts);
            self.teardown(ctx, "handshake timeout", true);
        }
        pending
    }

    /// Drops a session whose transport was closed by its room, on engine
    /// failure or removal. The room already told the peer.
    pub fn forget_closed_session(&self, ctx: &mut PeerContext) -> bool {
        let closed = ctx.session.as_ref().is_some_and(|s| s.transport.is_closed());
        if closed {
            if let Some(session) = ctx.session.take() {
                debug!("Room {} closed the transport of peer {}", session.room.id(), ctx.peer_id);
            }
            ctx.handshake_deadline = None;
        }
        closed
    }

    /// Implicit leave when the connection goes away
    pub fn disconnect(&self, ctx: &mut PeerContext) {
        self.teardown(ctx, "peer disconnected", false);
        info!("Peer {} disconnected", ctx.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::media::{LoopbackEngine, LoopbackOptions, RouterConfig};
    use crate::room::RoomRetention;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Client {
        ctx: PeerContext,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl Client {
        fn new(id: &str) -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                ctx: PeerContext::new(id.to_string(), tx),
                rx,
            }
        }

        async fn send(&mut self, gateway: &SignalingGateway, message: ClientMessage) -> ServerMessage {
            gateway.handle(&mut self.ctx, message).await;
            self.next()
        }

        fn next(&mut self) -> ServerMessage {
            self.rx.try_recv().expect("expected a queued message")
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }

        async fn join(&mut self, gateway: &SignalingGateway, room_id: &str) -> ServerMessage {
            self.send(gateway, ClientMessage::JoinRoom { room_id: room_id.to_string() }).await
        }

        async fn join_connected(&mut self, gateway: &SignalingGateway, room_id: &str) {
            let reply = self.join(gateway, room_id).await;
            assert!(matches!(reply, ServerMessage::TransportCreated { .. }), "{reply:?}");
            let reply = self.send(gateway, connect()).await;
            assert_eq!(reply, ServerMessage::ack("connect-transport"));
        }

        async fn produce(&mut self, gateway: &SignalingGateway, kind: MediaKind) -> String {
            match self.send(gateway, produce(kind)).await {
                ServerMessage::ProducerCreated { producer_id } => producer_id,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn gateway_with(engine: Arc<LoopbackEngine>, config: GatewayConfig, retention: RoomRetention) -> SignalingGateway {
        let metrics = ServerMetrics::new();
        let registry = Arc::new(RoomRegistry::new(
            engine,
            RouterConfig::default_codecs(),
            retention,
            EventBus::new(),
            metrics.clone(),
        ));
        SignalingGateway::new(registry, config, metrics)
    }

    fn gateway(engine: Arc<LoopbackEngine>) -> SignalingGateway {
        gateway_with(engine, GatewayConfig::default(), RoomRetention::Retain)
    }

    fn connect() -> ClientMessage {
        serde_json::from_value(json!({
            "type": "connect-transport",
            "dtlsParameters": {
                "role": "client",
                "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }]
            }
        }))
        .unwrap()
    }

    fn produce(kind: MediaKind) -> ClientMessage {
        let codec = match kind {
            MediaKind::Audio => json!({ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }),
            MediaKind::Video => json!({ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }),
        };
        serde_json::from_value(json!({
            "type": "produce",
            "kind": kind,
            "rtpParameters": { "mid": "0", "codecs": [codec], "encodings": [{ "ssrc": 1234 }] }
        }))
        .unwrap()
    }

    fn browser_capabilities() -> RtpCapabilities {
        serde_json::from_value(json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
                { "kind": "video", "mimeType": "video/rtx", "clockRate": 90000 }
            ]
        }))
        .unwrap()
    }

    fn consume(producer_id: &str, rtp_capabilities: RtpCapabilities) -> ClientMessage {
        ClientMessage::Consume {
            producer_id: producer_id.to_string(),
            rtp_capabilities,
        }
    }

    fn resume(consumer_id: &str) -> ClientMessage {
        ClientMessage::ResumeConsumer {
            consumer_id: consumer_id.to_string(),
        }
    }

    fn error_code(message: &ServerMessage) -> &str {
        match message {
            ServerMessage::Error { code, .. } => code.as_str(),
            other => panic!("expected error, got {other:?}"),
        }
    }

    fn consumer_created(message: ServerMessage) -> (String, MediaKind) {
        match message {
            ServerMessage::ConsumerCreated { consumer_id, kind, .. } => (consumer_id, kind),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn live_consumer(gateway: &SignalingGateway, room_id: &str, peer_id: &str, consumer_id: &str) -> Arc<ConsumerSession> {
        let room = gateway.registry().get(room_id).unwrap();
        match room.find_consumer(peer_id, consumer_id) {
            ConsumerLookup::Own(consumer) => consumer,
            _ => panic!("consumer {consumer_id} not in room"),
        }
    }

    #[tokio::test]
    async fn test_scenario_publish_and_subscribe() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine.clone());
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");

        p1.join_connected(&gateway, "R1").await;
        let video = p1.produce(&gateway, MediaKind::Video).await;
        let audio = p1.produce(&gateway, MediaKind::Audio).await;

        let reply = p2.join(&gateway, "R1").await;
        assert!(matches!(reply, ServerMessage::TransportCreated { .. }));
        let announced = p2.drain();
        assert_eq!(announced.len(), 2);
        assert!(announced.contains(&ServerMessage::NewProducer { producer_id: video.clone(), kind: MediaKind::Video }));
        assert!(announced.contains(&ServerMessage::NewProducer { producer_id: audio.clone(), kind: MediaKind::Audio }));
        assert_eq!(p2.send(&gateway, connect()).await, ServerMessage::ack("connect-transport"));

        let (consumer_id, kind) = consumer_created(p2.send(&gateway, consume(&video, browser_capabilities())).await);
        assert_eq!(kind, MediaKind::Video);
        let consumer = live_consumer(&gateway, "R1", "p2", &consumer_id);
        assert!(consumer.is_paused());

        assert_eq!(p2.send(&gateway, resume(&consumer_id)).await, ServerMessage::ack("resume-consumer"));
        assert!(!consumer.is_paused());
        assert_eq!(engine.resume_count(&consumer_id), 1);
    }

    #[tokio::test]
    async fn test_scenario_publisher_disconnects() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine.clone());
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");

        p1.join_connected(&gateway, "R1").await;
        let video = p1.produce(&gateway, MediaKind::Video).await;
        let audio = p1.produce(&gateway, MediaKind::Audio).await;
        p2.join_connected(&gateway, "R1").await;
        p2.drain();

        let (consumer_id, _) = consumer_created(p2.send(&gateway, consume(&video, browser_capabilities())).await);
        p2.send(&gateway, resume(&consumer_id)).await;
        let consumer = live_consumer(&gateway, "R1", "p2", &consumer_id);
        let p1_transport = p1.ctx.session().unwrap().transport.clone();

        gateway.disconnect(&mut p1.ctx);

        assert_eq!(p1_transport.state(), TransportState::Closed);
        assert_eq!(consumer.state(), crate::session::ConsumerState::Closed);
        let room = gateway.registry().get("R1").unwrap();
        assert!(room.producer_ids().is_empty());
        assert!(room.consumer_ids().is_empty());

        let events = p2.drain();
        assert!(events.contains(&ServerMessage::ProducerClosed {
            producer_id: video,
            consumer_ids: vec![consumer_id.clone()],
        }));
        assert!(events.contains(&ServerMessage::ProducerClosed {
            producer_id: audio,
            consumer_ids: Vec::new(),
        }));

        assert_eq!(p2.send(&gateway, resume(&consumer_id)).await, ServerMessage::ack("resume-consumer"));
        assert_eq!(engine.resume_count(&consumer_id), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenario_concurrent_joins_share_router() {
        let engine = Arc::new(LoopbackEngine::with_options(LoopbackOptions {
            router_delay: Duration::from_millis(25),
            ..Default::default()
        }));
        let gateway = gateway(engine.clone());

        let joins: Vec<_> = ["p1", "p3"]
            .into_iter()
            .map(|id| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    let mut client = Client::new(id);
                    let reply = client.join(&gateway, "R2").await;
                    (client, reply)
                })
            })
            .collect();

        let mut capabilities = Vec::new();
        let mut clients = Vec::new();
        for join in joins {
            let (client, reply) = join.await.unwrap();
            match reply {
                ServerMessage::TransportCreated { router_capabilities, .. } => capabilities.push(router_capabilities),
                other => panic!("unexpected {other:?}"),
            }
            clients.push(client);
        }

        assert_eq!(engine.routers_created(), 1);
        assert_eq!(capabilities[0], capabilities[1]);
        assert_eq!(gateway.registry().room_count(), 1);
        assert_eq!(gateway.registry().get("R2").unwrap().peer_count(), 2);
    }

    #[tokio::test]
    async fn test_consume_requires_active_producer() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        p2.join_connected(&gateway, "R1").await;

        let reply = p2.send(&gateway, consume("missing", browser_capabilities())).await;
        assert_eq!(error_code(&reply), "not-found");

        let video = p1.produce(&gateway, MediaKind::Video).await;
        p2.drain();
        p1.send(&gateway, ClientMessage::CloseProducer { producer_id: video.clone() }).await;
        p2.drain();
        let reply = p2.send(&gateway, consume(&video, browser_capabilities())).await;
        assert_eq!(error_code(&reply), "not-found");

        // A producer of another room is just as unknown here
        let mut p3 = Client::new("p3");
        p3.join_connected(&gateway, "R9").await;
        let elsewhere = p3.produce(&gateway, MediaKind::Video).await;
        let reply = p2.send(&gateway, consume(&elsewhere, browser_capabilities())).await;
        assert_eq!(error_code(&reply), "not-found");
        assert!(p2.ctx.session().is_some());
    }

    #[tokio::test]
    async fn test_consume_capability_gating() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        p2.join_connected(&gateway, "R1").await;
        let video = p1.produce(&gateway, MediaKind::Video).await;
        p2.drain();

        let audio_only: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }]
        }))
        .unwrap();
        let reply = p2.send(&gateway, consume(&video, audio_only)).await;
        assert_eq!(error_code(&reply), "not-supported");

        let reply = p2.send(&gateway, consume(&video, browser_capabilities())).await;
        assert!(matches!(reply, ServerMessage::ConsumerCreated { .. }));
    }

    #[tokio::test]
    async fn test_requests_need_connected_transport() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");

        let reply = p1.send(&gateway, produce(MediaKind::Video)).await;
        assert_eq!(error_code(&reply), "state");

        p1.join(&gateway, "R1").await;
        let reply = p1.send(&gateway, produce(MediaKind::Video)).await;
        assert_eq!(error_code(&reply), "state");
        assert!(gateway.registry().get("R1").unwrap().producer_ids().is_empty());

        p1.send(&gateway, connect()).await;
        let reply = p1.send(&gateway, connect()).await;
        assert_eq!(error_code(&reply), "state");
        assert!(p1.ctx.session().is_some());
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");

        let reply = p1.join(&gateway, "   ").await;
        assert_eq!(error_code(&reply), "validation");
        let reply = p1.join(&gateway, &"x".repeat(129)).await;
        assert_eq!(error_code(&reply), "validation");

        p1.join_connected(&gateway, "R1").await;
        let mismatched: ClientMessage = serde_json::from_value(json!({
            "type": "produce",
            "kind": "video",
            "rtpParameters": { "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000 }] }
        }))
        .unwrap();
        let reply = p1.send(&gateway, mismatched).await;
        assert_eq!(error_code(&reply), "validation");

        let bad = super::super::protocol::decode(r#"{"type":"consume","producerId":"x"}"#).unwrap_err();
        gateway.reject(&p1.ctx, bad);
        match p1.next() {
            ServerMessage::Error { request, code, .. } => {
                assert_eq!(request.as_deref(), Some("consume"));
                assert_eq!(code, "validation");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_is_idempotent_and_scoped_to_owner() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine.clone());
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        p2.join_connected(&gateway, "R1").await;
        let video = p1.produce(&gateway, MediaKind::Video).await;
        p2.drain();
        let (consumer_id, _) = consumer_created(p2.send(&gateway, consume(&video, browser_capabilities())).await);

        // Someone else's consumer id is never resumed
        let reply = p1.send(&gateway, resume(&consumer_id)).await;
        assert_eq!(error_code(&reply), "not-found");
        assert_eq!(engine.resume_count(&consumer_id), 0);

        assert_eq!(p2.send(&gateway, resume(&consumer_id)).await, ServerMessage::ack("resume-consumer"));
        assert_eq!(p2.send(&gateway, resume(&consumer_id)).await, ServerMessage::ack("resume-consumer"));
        assert_eq!(engine.resume_count(&consumer_id), 1);

        assert_eq!(p2.send(&gateway, resume("never-existed")).await, ServerMessage::ack("resume-consumer"));

        let pause = ClientMessage::PauseConsumer { consumer_id: consumer_id.clone() };
        assert_eq!(p2.send(&gateway, pause).await, ServerMessage::ack("pause-consumer"));
        assert!(live_consumer(&gateway, "R1", "p2", &consumer_id).is_paused());
    }

    #[tokio::test]
    async fn test_replacement_closes_before_announcing() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        p2.join_connected(&gateway, "R1").await;

        let first = p1.produce(&gateway, MediaKind::Video).await;
        p2.drain();
        let (consumer_id, _) = consumer_created(p2.send(&gateway, consume(&first, browser_capabilities())).await);
        let old_consumer = live_consumer(&gateway, "R1", "p2", &consumer_id);

        let second = p1.produce(&gateway, MediaKind::Video).await;
        assert_ne!(first, second);

        assert_eq!(
            p2.drain(),
            vec![
                ServerMessage::ProducerClosed {
                    producer_id: first.clone(),
                    consumer_ids: vec![consumer_id.clone()],
                },
                ServerMessage::NewProducer {
                    producer_id: second.clone(),
                    kind: MediaKind::Video,
                },
            ]
        );
        assert_eq!(old_consumer.state(), crate::session::ConsumerState::Closed);
        let room = gateway.registry().get("R1").unwrap();
        assert_eq!(room.producer_ids(), vec![second]);
        assert!(room.active_producer(&first).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_tears_down_transport() {
        let engine = Arc::new(LoopbackEngine::with_options(LoopbackOptions {
            connect_delay: Duration::from_secs(60),
            ..Default::default()
        }));
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        p1.join(&gateway, "R1").await;
        let transport = p1.ctx.session().unwrap().transport.clone();

        let reply = p1.send(&gateway, connect()).await;
        assert_eq!(error_code(&reply), "engine");
        assert_eq!(
            p1.next(),
            ServerMessage::TransportClosed {
                transport_id: transport.id().to_string(),
                reason: "transport connect timed out after 10s".to_string(),
            }
        );
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(p1.ctx.session().is_none());
        assert_eq!(gateway.registry().get("R1").unwrap().peer_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_handshake_tears_down_transport() {
        let engine = Arc::new(LoopbackEngine::with_options(LoopbackOptions {
            reject_connect: true,
            ..Default::default()
        }));
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        p1.join(&gateway, "R1").await;

        let reply = p1.send(&gateway, connect()).await;
        assert_eq!(error_code(&reply), "engine");
        assert!(matches!(p1.next(), ServerMessage::TransportClosed { .. }));
        assert!(p1.ctx.session().is_none());
    }

    #[tokio::test]
    async fn test_handshake_deadline_expires_unconnected_transport() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        p1.join(&gateway, "R1").await;
        assert!(p1.ctx.handshake_deadline().is_some());

        assert!(gateway.expire_handshake(&mut p1.ctx));
        match p1.next() {
            ServerMessage::TransportClosed { reason, .. } => assert_eq!(reason, "handshake timeout"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(p1.ctx.session().is_none());

        let mut p2 = Client::new("p2");
        p2.join_connected(&gateway, "R1").await;
        assert!(p2.ctx.handshake_deadline().is_none());
        assert!(!gateway.expire_handshake(&mut p2.ctx));
        assert!(p2.ctx.session().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_join_times_out() {
        let engine = Arc::new(LoopbackEngine::with_options(LoopbackOptions {
            router_delay: Duration::from_secs(30),
            ..Default::default()
        }));
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");

        let reply = p1.join(&gateway, "R1").await;
        assert_eq!(error_code(&reply), "engine");
        assert!(p1.ctx.session().is_none());
    }

    #[tokio::test]
    async fn test_engine_death_fails_every_peer() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine.clone());
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        p2.join_connected(&gateway, "R3").await;

        engine.fail("worker exited");
        let reply = p1.send(&gateway, produce(MediaKind::Video)).await;
        assert_eq!(error_code(&reply), "engine");

        for client in [&mut p1, &mut p2] {
            let events = client.drain();
            assert!(
                events.iter().any(|e| matches!(e, ServerMessage::EngineFailed { .. })),
                "{events:?}"
            );
            assert!(events.iter().any(|e| matches!(e, ServerMessage::TransportClosed { .. })));
        }
        assert_eq!(gateway.registry().room_count(), 0);

        let mut p3 = Client::new("p3");
        let reply = p3.join(&gateway, "R1").await;
        assert_eq!(error_code(&reply), "engine");

        gateway.registry().install_engine(Arc::new(LoopbackEngine::new()));
        let reply = p3.join(&gateway, "R1").await;
        assert!(matches!(reply, ServerMessage::TransportCreated { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_during_produce_leaves_no_producer() {
        let engine = Arc::new(LoopbackEngine::with_options(LoopbackOptions {
            produce_delay: Duration::from_millis(200),
            ..Default::default()
        }));
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        p1.join_connected(&gateway, "R1").await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            gateway.handle(&mut p1.ctx, produce(MediaKind::Video)),
        )
        .await;
        assert!(cancelled.is_err());
        gateway.disconnect(&mut p1.ctx);

        let room = gateway.registry().get("R1").unwrap();
        assert!(room.producer_ids().is_empty());
        assert_eq!(room.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_and_release_when_empty() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway_with(engine.clone(), GatewayConfig::default(), RoomRetention::ReleaseWhenEmpty);
        let mut p1 = Client::new("p1");
        p1.join_connected(&gateway, "R1").await;

        assert_eq!(p1.send(&gateway, ClientMessage::LeaveRoom).await, ServerMessage::ack("leave-room"));
        assert!(p1.ctx.session().is_none());
        assert_eq!(gateway.registry().room_count(), 0);

        p1.join_connected(&gateway, "R1").await;
        assert_eq!(engine.routers_created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_racing_release_moves_to_fresh_room() {
        let engine = Arc::new(LoopbackEngine::with_options(LoopbackOptions {
            transport_delay: Duration::from_millis(100),
            ..Default::default()
        }));
        let gateway = gateway_with(engine.clone(), GatewayConfig::default(), RoomRetention::ReleaseWhenEmpty);
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        let first_room = p1.ctx.session().unwrap().room.clone();

        // p1 leaves while p2 waits on its transport in the same room
        let (reply, left) = tokio::join!(p2.join(&gateway, "R1"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            p1.send(&gateway, ClientMessage::LeaveRoom).await
        });
        assert_eq!(left, ServerMessage::ack("leave-room"));
        assert!(matches!(reply, ServerMessage::TransportCreated { .. }), "{reply:?}");
        assert!(first_room.is_retired());
        assert_eq!(engine.routers_created(), 2);

        let session = p2.ctx.session().unwrap();
        assert!(!Arc::ptr_eq(&session.room, &first_room));
        assert_eq!(session.room.peer_count(), 1);
        assert!(p2.drain().is_empty());
    }

    #[tokio::test]
    async fn test_room_shutdown_releases_peer_sessions() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine.clone());
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        let reply = p2.join(&gateway, "R2").await;
        assert!(matches!(reply, ServerMessage::TransportCreated { .. }));

        let r1_closed = p1.ctx.transport_closed().unwrap();
        let r2_closed = p2.ctx.transport_closed().unwrap();
        assert!(gateway.registry().remove("R1"));
        assert!(r1_closed.is_cancelled());
        assert!(!r2_closed.is_cancelled());

        assert!(gateway.forget_closed_session(&mut p1.ctx));
        assert!(p1.ctx.session().is_none());
        assert!(!gateway.forget_closed_session(&mut p2.ctx));
        assert!(p2.ctx.session().is_some());

        engine.fail("worker exited");
        gateway.registry().fail_all("worker exited");
        r2_closed.cancelled().await;
        assert!(gateway.forget_closed_session(&mut p2.ctx));
        assert!(p2.ctx.session().is_none());
        assert!(p2.ctx.handshake_deadline().is_none());
        assert!(p2
            .drain()
            .iter()
            .any(|e| matches!(e, ServerMessage::EngineFailed { .. })));
    }

    #[tokio::test]
    async fn test_rejoin_replaces_session() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        let mut p1 = Client::new("p1");
        p1.join_connected(&gateway, "R1").await;
        let first = p1.ctx.session().unwrap().transport.clone();

        p1.join(&gateway, "R2").await;
        assert_eq!(first.state(), TransportState::Closed);
        assert_eq!(gateway.registry().get("R1").unwrap().peer_count(), 0);
        assert_eq!(p1.ctx.session().unwrap().room_id(), "R2");
    }

    #[tokio::test]
    async fn test_consumer_limit() {
        let engine = Arc::new(LoopbackEngine::new());
        let config = GatewayConfig {
            max_consumers_per_peer: 1,
            ..GatewayConfig::default()
        };
        let gateway = gateway_with(engine, config, RoomRetention::Retain);
        let mut p1 = Client::new("p1");
        let mut p2 = Client::new("p2");
        p1.join_connected(&gateway, "R1").await;
        p2.join_connected(&gateway, "R1").await;
        let video = p1.produce(&gateway, MediaKind::Video).await;
        p2.drain();

        assert!(matches!(
            p2.send(&gateway, consume(&video, browser_capabilities())).await,
            ServerMessage::ConsumerCreated { .. }
        ));
        let reply = p2.send(&gateway, consume(&video, browser_capabilities())).await;
        assert_eq!(error_code(&reply), "validation");
    }

    #[tokio::test]
    async fn test_engine_is_reported_by_name() {
        let engine = Arc::new(LoopbackEngine::new());
        let gateway = gateway(engine);
        assert_eq!(gateway.registry().engine().name(), "loopback");
    }
}
