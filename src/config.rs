#![forbid(unsafe_code)]

// Server configuration read from environment variables

use crate::media::{MediaConfig, TransportConfig};
use crate::room::RoomRetention;
use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PORT: u16 = 3004;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_CONSUMERS_PER_PEER: usize = 16;

/// Which media engine backs the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Mediasoup,
    Loopback,
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(feature = "mediasoup") {
            EngineKind::Mediasoup
        } else {
            EngineKind::Loopback
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mediasoup" => Ok(EngineKind::Mediasoup),
            "loopback" => Ok(EngineKind::Loopback),
            other => Err(format!("unknown media engine: {other}")),
        }
    }
}

/// Per-request limits applied by the signaling gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bound on join and connect, and on the time from join to a connected transport
    pub handshake_timeout: Duration,
    pub max_consumers_per_peer: usize,
    pub transport: TransportConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            max_consumers_per_peer: DEFAULT_MAX_CONSUMERS_PER_PEER,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    /// Bearer token guarding /metrics
    pub metrics_token: Option<String>,
    pub engine: EngineKind,
    pub retention: RoomRetention,
    pub media: MediaConfig,
    pub gateway: GatewayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            metrics_token: None,
            engine: EngineKind::default(),
            retention: RoomRetention::default(),
            media: MediaConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("Invalid {key}: {raw}")),
        _ => Ok(default),
    }
}

/// Zero disables nothing useful here, so it falls back to the default
fn non_zero<T: PartialEq + Default + Copy + std::fmt::Display>(key: &str, value: T, default: T) -> T {
    if value == T::default() {
        warn!("{}=0 is not usable, using default {}", key, default);
        default
    } else {
        value
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = parse(&lookup, "PORT", DEFAULT_PORT)?;

        let max_connections = non_zero(
            "MAX_CONNECTIONS",
            parse(&lookup, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            DEFAULT_MAX_CONNECTIONS,
        );
        let idle_timeout_secs = non_zero(
            "IDLE_TIMEOUT_SECS",
            parse(&lookup, "IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?,
            DEFAULT_IDLE_TIMEOUT_SECS,
        );
        let handshake_timeout_ms = non_zero(
            "HANDSHAKE_TIMEOUT_MS",
            parse(&lookup, "HANDSHAKE_TIMEOUT_MS", DEFAULT_HANDSHAKE_TIMEOUT_MS)?,
            DEFAULT_HANDSHAKE_TIMEOUT_MS,
        );
        let max_consumers_per_peer = non_zero(
            "MAX_CONSUMERS_PER_PEER",
            parse(&lookup, "MAX_CONSUMERS_PER_PEER", DEFAULT_MAX_CONSUMERS_PER_PEER)?,
            DEFAULT_MAX_CONSUMERS_PER_PEER,
        );

        let engine = parse(&lookup, "MEDIA_ENGINE", EngineKind::default())?;
        if engine == EngineKind::Mediasoup && !cfg!(feature = "mediasoup") {
            bail!("MEDIA_ENGINE=mediasoup requires building with the `mediasoup` feature");
        }
        let retention = parse(&lookup, "ROOM_RETENTION", RoomRetention::default())?;

        let mut transport = TransportConfig::default();
        transport.rtc_min_port = parse(&lookup, "RTC_MIN_PORT", transport.rtc_min_port)?;
        transport.rtc_max_port = parse(&lookup, "RTC_MAX_PORT", transport.rtc_max_port)?;
        if transport.rtc_min_port > transport.rtc_max_port {
            bail!(
                "RTC_MIN_PORT ({}) must not exceed RTC_MAX_PORT ({})",
                transport.rtc_min_port,
                transport.rtc_max_port
            );
        }
        if let Some(ip) = lookup("ANNOUNCE_IP").filter(|ip| !ip.trim().is_empty()) {
            let addr: IpAddr = ip
                .trim()
                .parse()
                .with_context(|| format!("Invalid ANNOUNCE_IP: {ip}"))?;
            transport = transport.with_announced_address(addr);
        }

        let media = MediaConfig {
            transport_config: transport.clone(),
            ..MediaConfig::default()
        };

        Ok(Self {
            port,
            max_connections,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            metrics_token: lookup("METRICS_TOKEN").filter(|t| !t.is_empty()),
            engine,
            retention,
            media,
            gateway: GatewayConfig {
                handshake_timeout: Duration::from_millis(handshake_timeout_ms),
                max_consumers_per_peer,
                transport,
            },
        })
    }
}
