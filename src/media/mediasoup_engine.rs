#![forbid(unsafe_code)]

// mediasoup-backed media engine. One worker per engine; a dead worker flips
// the status channel and the registry supervisor builds a new engine.
//
// The facade types mirror mediasoup's JSON wire shapes, so conversions go
// through serde_json instead of field-by-field mapping.

use crate::media::config::{MediaConfig, TransportConfig, WorkerConfig};
use crate::media::types::{
    DtlsParameters, EngineStatus, MediaError, MediaKind, MediaResult, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportInfo,
};
use crate::media::{ConsumerHandle, MediaEngine, ProducerHandle, RouterHandle, TransportHandle};
use async_trait::async_trait;
use mediasoup::prelude as ms;
use mediasoup::prelude::{Transport as _, TransportGeneric as _};
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

fn convert<T, U>(value: &T, fail: fn(String) -> MediaError, what: &str) -> MediaResult<U>
where
    T: Serialize,
    U: DeserializeOwned,
{
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| fail(format!("invalid {what}: {e}")))
}

fn to_ms_kind(kind: MediaKind) -> ms::MediaKind {
    match kind {
        MediaKind::Audio => ms::MediaKind::Audio,
        MediaKind::Video => ms::MediaKind::Video,
    }
}

fn from_ms_kind(kind: ms::MediaKind) -> MediaKind {
    match kind {
        ms::MediaKind::Audio => MediaKind::Audio,
        ms::MediaKind::Video => MediaKind::Video,
    }
}

fn worker_settings(config: &WorkerConfig) -> ms::WorkerSettings {
    let mut settings = ms::WorkerSettings::default();

    settings.log_level = match config.log_level.as_str() {
        "debug" => WorkerLogLevel::Debug,
        "error" => WorkerLogLevel::Error,
        "none" => WorkerLogLevel::None,
        _ => WorkerLogLevel::Warn,
    };
    settings.log_tags = config
        .log_tags
        .iter()
        .filter_map(|tag| match tag.as_str() {
            "info" => Some(WorkerLogTag::Info),
            "ice" => Some(WorkerLogTag::Ice),
            "dtls" => Some(WorkerLogTag::Dtls),
            "rtp" => Some(WorkerLogTag::Rtp),
            "srtp" => Some(WorkerLogTag::Srtp),
            "rtcp" => Some(WorkerLogTag::Rtcp),
            other => {
                warn!("Ignoring unknown worker log tag: {}", other);
                None
            }
        })
        .collect();

    if let (Some(cert), Some(key)) = (&config.dtls_certificate_file, &config.dtls_private_key_file) {
        settings.dtls_files = Some(WorkerDtlsFiles {
            certificate: cert.clone().into(),
            private_key: key.clone().into(),
        });
    }

    settings
}

fn transport_options(config: &TransportConfig) -> ms::WebRtcTransportOptions {
    let listen_info = ms::ListenInfo {
        protocol: ms::Protocol::Udp,
        ip: config.listen_ip,
        announced_address: config.announced_address.clone(),
        port: None,
        port_range: Some(config.rtc_min_port..=config.rtc_max_port),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    };
    let mut options = ms::WebRtcTransportOptions::new(ms::WebRtcTransportListenInfos::new(listen_info));
    options.initial_available_outgoing_bitrate = config.initial_available_outgoing_bitrate;
    options
}

/// Media engine backed by a single mediasoup worker
pub struct MediasoupEngine {
    worker: ms::Worker,
    status: Arc<watch::Sender<EngineStatus>>,
    // Owns the executor the worker runs on
    _manager: mediasoup::worker_manager::WorkerManager,
}

impl MediasoupEngine {
    /// Spawns a worker process
    ///
    /// # Errors
    /// Returns an error if the worker cannot be started
    pub async fn new(config: &MediaConfig) -> anyhow::Result<Self> {
        let manager = mediasoup::worker_manager::WorkerManager::new();
        let worker = manager
            .create_worker(worker_settings(&config.worker_config))
            .await
            .map_err(|e| MediaError::WorkerDied(format!("Failed to create worker: {e}")))?;

        let (status, _) = watch::channel(EngineStatus::Running);
        let status = Arc::new(status);
        let worker_id = worker.id();

        worker
            .on_dead({
                let status = status.clone();
                move |reason| {
                    let reason = match reason {
                        Ok(()) => "worker exited".to_string(),
                        Err(e) => format!("worker died: {e}"),
                    };
                    error!("Worker {} died: {}", worker_id, reason);
                    status.send_replace(EngineStatus::Failed { reason });
                }
            })
            .detach();

        info!("Created mediasoup worker {}", worker_id);
        Ok(Self {
            worker,
            status,
            _manager: manager,
        })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> MediaResult<Arc<dyn RouterHandle>> {
        if let EngineStatus::Failed { reason } = &*self.status.borrow() {
            return Err(MediaError::WorkerDied(reason.clone()));
        }

        let media_codecs: Vec<ms::RtpCodecCapability> = convert(&codecs, MediaError::Router, "router codecs")?;
        let router = self
            .worker
            .create_router(ms::RouterOptions::new(media_codecs))
            .await
            .map_err(|e| MediaError::Router(format!("Failed to create router: {e}")))?;

        let id = router.id().to_string();
        router
            .on_worker_close({
                let id = id.clone();
                move || warn!("Worker closed under router {}", id)
            })
            .detach();
        debug!("Created router {}", id);

        Ok(Arc::new(MediasoupRouter {
            id,
            router: StdMutex::new(Some(router)),
        }))
    }

    fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    fn name(&self) -> &'static str {
        "mediasoup"
    }
}

struct MediasoupRouter {
    id: String,
    router: StdMutex<Option<ms::Router>>,
}

impl MediasoupRouter {
    fn router(&self) -> MediaResult<ms::Router> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("router {}", self.id)))
    }
}

#[async_trait]
impl RouterHandle for MediasoupRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.router()
            .and_then(|router| convert(router.rtp_capabilities(), MediaError::Router, "router capabilities"))
            .unwrap_or_default()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ms::ProducerId>() else {
            return false;
        };
        match convert::<_, ms::RtpCapabilities>(rtp_capabilities, MediaError::Consumer, "capabilities") {
            Ok(caps) => router.can_consume(&producer_id, &caps),
            Err(_) => false,
        }
    }

    async fn create_transport(&self, config: &TransportConfig) -> MediaResult<Arc<dyn TransportHandle>> {
        let router = self.router()?;
        let transport = router
            .create_webrtc_transport(transport_options(config))
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to create transport: {e}")))?;

        if let Some(bitrate) = config.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!("Failed to cap incoming bitrate on transport {}: {}", transport.id(), e);
            }
        }

        let info = TransportInfo {
            id: transport.id().to_string(),
            ice_parameters: convert(transport.ice_parameters(), MediaError::Transport, "ICE parameters")?,
            ice_candidates: convert(transport.ice_candidates(), MediaError::Transport, "ICE candidates")?,
            dtls_parameters: convert(&transport.dtls_parameters(), MediaError::Transport, "DTLS parameters")?,
        };

        transport
            .on_dtls_state_change({
                let id = info.id.clone();
                move |state| debug!("DTLS state {:?} on transport {}", state, id)
            })
            .detach();
        transport
            .on_ice_state_change({
                let id = info.id.clone();
                move |state| debug!("ICE state {:?} on transport {}", state, id)
            })
            .detach();

        Ok(Arc::new(MediasoupTransport {
            info,
            transport: StdMutex::new(Some(transport)),
        }))
    }

    fn close(&self) {
        if self.router.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!("Router {} released", self.id);
        }
    }
}

struct MediasoupTransport {
    info: TransportInfo,
    transport: StdMutex<Option<ms::WebRtcTransport>>,
}

impl MediasoupTransport {
    fn transport(&self) -> MediaResult<ms::WebRtcTransport> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("transport {}", self.info.id)))
    }
}

#[async_trait]
impl TransportHandle for MediasoupTransport {
    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()> {
        let transport = self.transport()?;
        let dtls_parameters = convert(&dtls_parameters, MediaError::Transport, "DTLS parameters")?;
        transport
            .connect(ms::WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to connect transport: {e}")))
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> MediaResult<Arc<dyn ProducerHandle>> {
        let transport = self.transport()?;
        let rtp_parameters = convert(&rtp_parameters, MediaError::Producer, "RTP parameters")?;
        let producer = transport
            .produce(ms::ProducerOptions::new(to_ms_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::Producer(format!("Failed to create producer: {e}")))?;

        Ok(Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind: from_ms_kind(producer.kind()),
            producer: StdMutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Arc<dyn ConsumerHandle>> {
        let transport = self.transport()?;
        let parsed: ms::ProducerId = producer_id
            .parse()
            .map_err(|e| MediaError::Consumer(format!("invalid producer id {producer_id}: {e}")))?;
        let rtp_capabilities = convert(&rtp_capabilities, MediaError::Consumer, "RTP capabilities")?;

        let mut options = ms::ConsumerOptions::new(parsed, rtp_capabilities);
        options.paused = true;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to create consumer: {e}")))?;

        Ok(Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: from_ms_kind(consumer.kind()),
            rtp_parameters: convert(consumer.rtp_parameters(), MediaError::Consumer, "consumer RTP parameters")?,
            consumer: StdMutex::new(Some(consumer)),
        }))
    }

    fn close(&self) {
        // Dropping the last handle closes the transport and everything on it
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    producer: StdMutex<Option<ms::Producer>>,
}

impl ProducerHandle for MediasoupProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.producer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer: StdMutex<Option<ms::Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> MediaResult<ms::Consumer> {
        self.consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("consumer {}", self.id)))
    }
}

#[async_trait]
impl ConsumerHandle for MediasoupConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer()?
            .resume()
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to resume consumer: {e}")))
    }

    async fn pause(&self) -> MediaResult<()> {
        self.consumer()?
            .pause()
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to pause consumer: {e}")))
    }

    fn close(&self) {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
