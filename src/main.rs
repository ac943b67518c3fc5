#![forbid(unsafe_code)]

use anyhow::Result;
use roomcast::config::{EngineKind, ServerConfig};
use roomcast::events::{spawn_journal, EventBus};
use roomcast::media::{LoopbackEngine, MediaConfig, MediaEngine};
use roomcast::metrics::ServerMetrics;
use roomcast::room::RoomRegistry;
use roomcast::signaling::{SignalingGateway, SignalingServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn build_engine(kind: EngineKind, media: &MediaConfig) -> Result<Arc<dyn MediaEngine>> {
    match kind {
        #[cfg(feature = "mediasoup")]
        EngineKind::Mediasoup => Ok(Arc::new(roomcast::media::MediasoupEngine::new(media).await?)),
        #[cfg(not(feature = "mediasoup"))]
        EngineKind::Mediasoup => {
            let _ = media;
            anyhow::bail!("built without the `mediasoup` feature")
        }
        EngineKind::Loopback => Ok(Arc::new(LoopbackEngine::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Roomcast - Starting server");

    let config = ServerConfig::from_env()?;
    info!(
        "Media engine {:?}, retention {:?}, candidates announce {}",
        config.engine,
        config.retention,
        config.media.transport_config.candidate_address()
    );

    let metrics = ServerMetrics::new();
    let events = EventBus::new();
    let journal = spawn_journal(&events);

    let engine = build_engine(config.engine, &config.media).await?;
    let registry = Arc::new(RoomRegistry::new(
        engine,
        config.media.router_config.media_codecs.clone(),
        config.retention,
        events,
        metrics.clone(),
    ));

    let supervisor = registry.clone().supervise({
        let kind = config.engine;
        let media = config.media.clone();
        move || {
            let media = media.clone();
            async move { build_engine(kind, &media).await }
        }
    });

    let gateway = SignalingGateway::new(registry.clone(), config.gateway.clone(), metrics.clone());
    let signaling_server = SignalingServer::new(gateway, metrics, &config);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    supervisor.abort();
    registry.shutdown();
    journal.abort();

    info!("Server shutdown complete");
    Ok(())
}
