#![forbid(unsafe_code)]

// Media module - facade over the selective-forwarding media engine.
// The orchestrator only talks to the engine through these traits; packet
// forwarding, ICE/DTLS and codecs stay inside the engine.

pub mod config;
pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;

pub use config::{MediaConfig, RouterConfig, TransportConfig, WorkerConfig};
pub use loopback::{LoopbackEngine, LoopbackOptions};
#[cfg(feature = "mediasoup")]
pub use mediasoup_engine::MediasoupEngine;
pub use types::{
    DtlsParameters, EngineStatus, IceCandidate, IceParameters, MediaError, MediaKind,
    MediaResult, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportInfo,
};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide media engine (one worker process)
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a routing context supporting the given codecs
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> MediaResult<Arc<dyn RouterHandle>>;

    /// Worker liveness. Flips to `Failed` once and never recovers; a
    /// replacement engine must be built instead.
    fn status(&self) -> watch::Receiver<EngineStatus>;

    /// Short name for logs and health output
    fn name(&self) -> &'static str;
}

/// One room's routing context
#[async_trait]
pub trait RouterHandle: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// The engine's own compatibility oracle
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(&self, config: &TransportConfig) -> MediaResult<Arc<dyn TransportHandle>>;

    fn close(&self);
}

/// A negotiated ICE/DTLS transport between one peer and the engine
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn info(&self) -> TransportInfo;

    /// Completes the engine side of the DTLS handshake
    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> MediaResult<Arc<dyn ProducerHandle>>;

    /// Consumers are always created paused
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Arc<dyn ConsumerHandle>>;

    fn close(&self);
}

pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn close(&self);
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn resume(&self) -> MediaResult<()>;

    async fn pause(&self) -> MediaResult<()>;

    fn close(&self);
}
