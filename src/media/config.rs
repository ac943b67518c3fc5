#![forbid(unsafe_code)]

// Configuration for the media worker, per-room routers, and WebRTC transports

use crate::media::types::{MediaKind, RtcpFeedback, RtpCodecCapability};
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr};

/// Main media configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub transport_config: TransportConfig,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// One of "debug", "warn", "error", "none"
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .into_iter()
                .map(String::from)
                .collect(),
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

fn params<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::new("nack", ""),
        RtcpFeedback::new("nack", "pli"),
        RtcpFeedback::new("ccm", "fir"),
        RtcpFeedback::new("goog-remb", ""),
        RtcpFeedback::new("transport-cc", ""),
    ]
}

impl RouterConfig {
    /// Opus, VP8, VP9 and H264, matching what browsers publish by default
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(111),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: params([("minptime", 10.into()), ("useinbandfec", 1.into())]),
                rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(96),
                clock_rate: 90_000,
                channels: None,
                parameters: params([("x-google-start-bitrate", 1000.into())]),
                rtcp_feedback: video_feedback(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP9".to_string(),
                preferred_payload_type: Some(98),
                clock_rate: 90_000,
                channels: None,
                parameters: params([
                    ("profile-id", 2.into()),
                    ("x-google-start-bitrate", 1000.into()),
                ]),
                rtcp_feedback: video_feedback(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                preferred_payload_type: Some(102),
                clock_rate: 90_000,
                channels: None,
                parameters: params([
                    ("packetization-mode", 1.into()),
                    ("profile-level-id", "4d0032".into()),
                    ("level-asymmetry-allowed", 1.into()),
                    ("x-google-start-bitrate", 1000.into()),
                ]),
                rtcp_feedback: video_feedback(),
            },
        ]
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            rtc_min_port: 10_000,
            rtc_max_port: 10_100,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: Some(1_500_000),
        }
    }
}

impl TransportConfig {
    /// Sets the public address advertised in ICE candidates
    pub fn with_announced_address(mut self, address: IpAddr) -> Self {
        self.announced_address = Some(address.to_string());
        self
    }

    /// Address peers should use to reach the transport
    pub fn candidate_address(&self) -> String {
        self.announced_address
            .clone()
            .unwrap_or_else(|| self.listen_ip.to_string())
    }
}
