#![forbid(unsafe_code)]

// WebSocket connection handler for individual peers.
//
// Three parts per connection: a send task draining the peer's outbound queue,
// a reader task doing idle timeout, rate limiting and decoding, and the
// dispatch loop below that feeds the gateway one request at a time. The
// reader keeps watching the socket while a request is in flight, so a
// disconnect cancels it instead of waiting for the engine.

use super::gateway::{PeerContext, SignalingGateway};
use super::protocol::{decode, ClientMessage, DecodeError, ServerMessage};
use crate::error::SessionError;
use crate::metrics::{Counter, ServerMetrics};
use crate::room::{deliver, PeerSender};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per peer.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// How long the send task may keep flushing after the peer is gone
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

#[derive(Debug, PartialEq, Eq)]
enum RateDecision {
    Allow,
    /// Over the limit; `warn` is set on the first rejection of a burst
    Deny { warn: bool },
}

/// Per-connection token bucket
struct TokenBucket {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl TokenBucket {
    fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    fn take(&mut self, now: Instant) -> RateDecision {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            RateDecision::Allow
        } else {
            let warn = !self.warned;
            self.warned = true;
            RateDecision::Deny { warn }
        }
    }
}

type Inbound = Result<ClientMessage, DecodeError>;

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    gateway: SignalingGateway,
    metrics: ServerMetrics,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", peer_id);

    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);

    let send_peer = peer_id.clone();
    let send_metrics = metrics.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message for peer {}: {}", send_peer, e);
                    continue;
                }
            };
            send_metrics.inc(Counter::MessagesSent);
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for peer: {}", send_peer);
    });

    let cancel = CancellationToken::new();
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_frames(
        ws_receiver,
        peer_id.clone(),
        tx.clone(),
        inbound_tx,
        metrics.clone(),
        idle_timeout,
        cancel.clone(),
    ));

    let mut ctx = PeerContext::new(peer_id.clone(), tx);
    loop {
        let deadline = ctx.handshake_deadline();
        let transport_closed = ctx.transport_closed();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = async {
                match &transport_closed {
                    Some(closed) => closed.cancelled().await,
                    None => std::future::pending().await,
                }
            } => {
                gateway.forget_closed_session(&mut ctx);
            }
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                gateway.expire_handshake(&mut ctx);
            }
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(message)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("Peer {} went away mid-request", peer_id);
                            break;
                        }
                        _ = gateway.handle(&mut ctx, message) => {}
                    }
                }
                Some(Err(rejected)) => gateway.reject(&ctx, rejected),
                None => break,
            }
        }
    }

    gateway.disconnect(&mut ctx);
    cancel.cancel();
    reader.abort();

    // Room entries are gone, so dropping the context closes the outbound queue
    drop(ctx);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        warn!("Send task for peer {} did not drain in time", peer_id);
        send_task.abort();
    }

    info!("Connection handler finished for peer: {}", peer_id);
}

/// Reads frames until the socket closes, goes idle, or the dispatch side
/// stops listening. Cancels `cancel` on exit.
async fn read_frames(
    mut ws_receiver: SplitStream<WebSocket>,
    peer_id: String,
    outbound: PeerSender,
    inbound: mpsc::Sender<Inbound>,
    metrics: ServerMetrics,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut bucket = TokenBucket::new(Instant::now());

    loop {
        // Idle timeout: close connection if no message within idle_timeout
        let msg = match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::MessagesReceived);

                match bucket.take(Instant::now()) {
                    RateDecision::Allow => {}
                    RateDecision::Deny { warn } => {
                        if warn {
                            warn!("Rate limit exceeded for peer {}", peer_id);
                            let err = SessionError::Validation(format!(
                                "rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                            ));
                            deliver(&outbound, &peer_id, ServerMessage::error(None, &err));
                        }
                        continue;
                    }
                }

                let decoded = decode(text.as_str());
                if let Err(rejected) = &decoded {
                    warn!("Invalid message from peer {}: {}", peer_id, rejected.error);
                }
                if inbound.send(decoded).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Peer {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            Message::Binary(_) => {
                let err = SessionError::Validation("binary frames are not supported".to_string());
                deliver(&outbound, &peer_id, ServerMessage::error(None, &err));
            }
        }
    }

    cancel.cancel();
}
