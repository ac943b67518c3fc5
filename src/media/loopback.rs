#![forbid(unsafe_code)]

// In-process media engine. It keeps the same bookkeeping a real SFU worker
// does (routers, transports, producers, consumers, pause state) without moving
// any packets. Used for local runs without a media worker and by the tests.

use crate::media::config::TransportConfig;
use crate::media::types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, EngineStatus, IceCandidate, IceParameters,
    MediaError, MediaKind, MediaResult, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportInfo,
};
use crate::media::{ConsumerHandle, MediaEngine, ProducerHandle, RouterHandle, TransportHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Artificial latency and fault injection for the loopback engine
#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    pub router_delay: Duration,
    pub transport_delay: Duration,
    pub connect_delay: Duration,
    pub produce_delay: Duration,
    /// Fail every DTLS connect as the worker would on a bad handshake
    pub reject_connect: bool,
}

struct EngineInner {
    options: LoopbackOptions,
    status: watch::Sender<EngineStatus>,
    routers_created: AtomicUsize,
    resumes: StdMutex<HashMap<String, usize>>,
    next_port: AtomicU32,
}

impl EngineInner {
    fn ensure_running(&self) -> MediaResult<()> {
        match &*self.status.borrow() {
            EngineStatus::Running => Ok(()),
            EngineStatus::Failed { reason } => Err(MediaError::WorkerDied(reason.clone())),
        }
    }
}

async fn delay(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

fn same_codec(mime_a: &str, clock_a: u32, mime_b: &str, clock_b: u32) -> bool {
    mime_a.eq_ignore_ascii_case(mime_b) && clock_a == clock_b
}

/// Loopback implementation of [`MediaEngine`]
pub struct LoopbackEngine {
    inner: Arc<EngineInner>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::with_options(LoopbackOptions::default())
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        let (status, _) = watch::channel(EngineStatus::Running);
        Self {
            inner: Arc::new(EngineInner {
                options,
                status,
                routers_created: AtomicUsize::new(0),
                resumes: StdMutex::new(HashMap::new()),
                next_port: AtomicU32::new(0),
            }),
        }
    }

    /// Number of routers ever created by this engine
    pub fn routers_created(&self) -> usize {
        self.inner.routers_created.load(Ordering::SeqCst)
    }

    /// Number of times the engine was asked to resume a consumer
    pub fn resume_count(&self, consumer_id: &str) -> usize {
        let resumes = self.inner.resumes.lock().unwrap_or_else(|e| e.into_inner());
        resumes.get(consumer_id).copied().unwrap_or(0)
    }

    /// Simulates death of the worker process
    pub fn fail(&self, reason: &str) {
        error!("Loopback worker failed: {}", reason);
        self.inner.status.send_replace(EngineStatus::Failed {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> MediaResult<Arc<dyn RouterHandle>> {
        self.inner.ensure_running()?;
        delay(self.inner.options.router_delay).await;
        self.inner.ensure_running()?;

        let mut next_payload_type = 100u8;
        let codecs = codecs
            .iter()
            .cloned()
            .map(|mut codec| {
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        let router = LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: Vec::new(),
            },
            producers: Arc::new(StdRwLock::new(HashMap::new())),
            engine: self.inner.clone(),
            closed: AtomicBool::new(false),
        };
        self.inner.routers_created.fetch_add(1, Ordering::SeqCst);
        info!("Created loopback router {}", router.id);
        Ok(Arc::new(router))
    }

    fn status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[derive(Clone)]
struct ProducerEntry {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: Arc<AtomicBool>,
}

type ProducerTable = Arc<StdRwLock<HashMap<String, ProducerEntry>>>;

struct LoopbackRouter {
    id: String,
    capabilities: RtpCapabilities,
    producers: ProducerTable,
    engine: Arc<EngineInner>,
    closed: AtomicBool,
}

impl LoopbackRouter {
    fn ensure_open(&self) -> MediaResult<()> {
        self.engine.ensure_running()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed(format!("router {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl RouterHandle for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = producers.get(producer_id) else {
            return false;
        };
        if entry.closed.load(Ordering::SeqCst) {
            return false;
        }
        entry.rtp_parameters.codecs.iter().any(|produced| {
            rtp_capabilities.codecs.iter().any(|wanted| {
                same_codec(&produced.mime_type, produced.clock_rate, &wanted.mime_type, wanted.clock_rate)
            })
        })
    }

    async fn create_transport(&self, config: &TransportConfig) -> MediaResult<Arc<dyn TransportHandle>> {
        self.ensure_open()?;
        delay(self.engine.options.transport_delay).await;
        self.ensure_open()?;

        let span = u32::from(config.rtc_max_port.saturating_sub(config.rtc_min_port)) + 1;
        let offset = self.engine.next_port.fetch_add(1, Ordering::SeqCst) % span;
        let port = config.rtc_min_port.saturating_add(offset as u16);

        let info = TransportInfo {
            id: Uuid::new_v4().to_string(),
            ice_parameters: IceParameters {
                username_fragment: Uuid::new_v4().simple().to_string()[..16].to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: Some(true),
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                address: config.candidate_address(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: Uuid::new_v4().simple().to_string().to_uppercase(),
                }],
            },
        };

        debug!("Created loopback transport {} on router {}", info.id, self.id);
        Ok(Arc::new(LoopbackTransport {
            info,
            producers: self.producers.clone(),
            engine: self.engine.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            children: StdMutex::new(Vec::new()),
            next_mid: AtomicU32::new(0),
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
            for entry in producers.values() {
                entry.closed.store(true, Ordering::SeqCst);
            }
            producers.clear();
            debug!("Closed loopback router {}", self.id);
        }
    }
}

struct LoopbackTransport {
    info: TransportInfo,
    producers: ProducerTable,
    engine: Arc<EngineInner>,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Closed flags of every producer/consumer created on this transport
    children: StdMutex<Vec<(Option<String>, Arc<AtomicBool>)>>,
    next_mid: AtomicU32,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> MediaResult<()> {
        self.engine.ensure_running()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed(format!("transport {}", self.info.id)));
        }
        Ok(())
    }

    fn adopt(&self, producer_id: Option<String>, flag: Arc<AtomicBool>) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((producer_id, flag));
    }
}

#[async_trait]
impl TransportHandle for LoopbackTransport {
    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()> {
        self.ensure_open()?;
        delay(self.engine.options.connect_delay).await;
        self.ensure_open()?;

        if self.engine.options.reject_connect {
            return Err(MediaError::Transport(format!(
                "DTLS handshake failed on transport {}",
                self.info.id
            )));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(MediaError::Transport("remote DTLS fingerprints missing".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::Transport(format!(
                "transport {} already connected",
                self.info.id
            )));
        }
        debug!("Loopback transport {} connected", self.info.id);
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> MediaResult<Arc<dyn ProducerHandle>> {
        self.ensure_open()?;
        delay(self.engine.options.produce_delay).await;
        self.ensure_open()?;

        if !rtp_parameters
            .codecs
            .iter()
            .any(|c| c.mime_type.to_ascii_lowercase().starts_with(kind.mime_prefix()))
        {
            return Err(MediaError::Producer(format!("no {kind} codec in rtpParameters")));
        }

        let id = Uuid::new_v4().to_string();
        let closed = Arc::new(AtomicBool::new(false));
        {
            let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
            producers.insert(
                id.clone(),
                ProducerEntry {
                    kind,
                    rtp_parameters,
                    closed: closed.clone(),
                },
            );
        }
        self.adopt(Some(id.clone()), closed.clone());

        Ok(Arc::new(LoopbackProducer {
            id,
            kind,
            closed,
            producers: self.producers.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Arc<dyn ConsumerHandle>> {
        self.ensure_open()?;

        let entry = {
            let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
            producers.get(producer_id).cloned()
        }
        .filter(|entry| !entry.closed.load(Ordering::SeqCst))
        .ok_or_else(|| MediaError::Consumer(format!("producer {producer_id} not found")))?;

        let mut rtp_parameters = entry.rtp_parameters.clone();
        rtp_parameters.codecs.retain(|produced| {
            rtp_capabilities.codecs.iter().any(|wanted| {
                same_codec(&produced.mime_type, produced.clock_rate, &wanted.mime_type, wanted.clock_rate)
            })
        });
        if rtp_parameters.codecs.is_empty() {
            return Err(MediaError::Consumer(format!(
                "no compatible codec for producer {producer_id}"
            )));
        }
        rtp_parameters.mid = Some(self.next_mid.fetch_add(1, Ordering::SeqCst).to_string());

        let closed = Arc::new(AtomicBool::new(false));
        self.adopt(None, closed.clone());

        Ok(Arc::new(LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: entry.kind,
            rtp_parameters,
            paused: AtomicBool::new(true),
            closed,
            producer_closed: entry.closed,
            engine: self.engine.clone(),
        }))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(|e| e.into_inner()));
        let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
        for (producer_id, flag) in children {
            flag.store(true, Ordering::SeqCst);
            if let Some(id) = producer_id {
                producers.remove(&id);
            }
        }
        debug!("Closed loopback transport {}", self.info.id);
    }
}

struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    closed: Arc<AtomicBool>,
    producers: ProducerTable,
}

impl ProducerHandle for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.producers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

impl Drop for LoopbackProducer {
    fn drop(&mut self) {
        ProducerHandle::close(self);
    }
}

struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: Arc<AtomicBool>,
    producer_closed: Arc<AtomicBool>,
    engine: Arc<EngineInner>,
}

impl LoopbackConsumer {
    fn ensure_live(&self) -> MediaResult<()> {
        self.engine.ensure_running()?;
        if self.closed.load(Ordering::SeqCst) || self.producer_closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed(format!("consumer {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerHandle for LoopbackConsumer {
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
        self.ensure_live()?;
        self.paused.store(false, Ordering::SeqCst);
        let mut resumes = self.engine.resumes.lock().unwrap_or_else(|e| e.into_inner());
        *resumes.entry(self.id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn pause(&self) -> MediaResult<()> {
        self.ensure_live()?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for LoopbackConsumer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
