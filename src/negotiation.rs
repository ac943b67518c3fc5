#![forbid(unsafe_code)]

// Capability negotiation between a producer and a receiver's declared
// capabilities. The pure part never touches the engine so it can be checked
// in isolation; `Negotiator` adds the live-producer check and the engine's
// own oracle.

use crate::error::{SessionError, SessionResult};
use crate::media::{MediaKind, RouterHandle, RtpCapabilities, RtpCodecCapability};
use crate::session::ProducerSession;
use serde_json::{Map, Value};

fn is_rtx(codec: &RtpCodecCapability) -> bool {
    codec.mime_type.to_ascii_lowercase().ends_with("/rtx")
}

fn param_u64(parameters: &Map<String, Value>, key: &str) -> Option<u64> {
    match parameters.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Same codec as far as forwarding is concerned
pub fn codecs_match(a: &RtpCodecCapability, b: &RtpCodecCapability) -> bool {
    if !a.mime_type.eq_ignore_ascii_case(&b.mime_type) || a.clock_rate != b.clock_rate {
        return false;
    }
    if a.kind == MediaKind::Audio && a.channels.unwrap_or(1) != b.channels.unwrap_or(1) {
        return false;
    }
    if a.mime_type.eq_ignore_ascii_case("video/h264") {
        let mode_a = param_u64(&a.parameters, "packetization-mode").unwrap_or(0);
        let mode_b = param_u64(&b.parameters, "packetization-mode").unwrap_or(0);
        if mode_a != mode_b {
            return false;
        }
    }
    true
}

/// Router codecs of `kind` that the receiver also declared
pub fn negotiate(
    router_capabilities: &RtpCapabilities,
    kind: MediaKind,
    requested: &RtpCapabilities,
) -> Vec<RtpCodecCapability> {
    router_capabilities
        .codecs
        .iter()
        .filter(|codec| codec.kind == kind && !is_rtx(codec))
        .filter(|codec| {
            requested
                .codecs
                .iter()
                .any(|wanted| wanted.kind == kind && !is_rtx(wanted) && codecs_match(codec, wanted))
        })
        .cloned()
        .collect()
}

pub fn can_consume(router_capabilities: &RtpCapabilities, kind: MediaKind, requested: &RtpCapabilities) -> bool {
    !negotiate(router_capabilities, kind, requested).is_empty()
}

/// Consume-time gate bound to one room's router
pub struct Negotiator<'a> {
    router: &'a dyn RouterHandle,
}

impl<'a> Negotiator<'a> {
    pub fn new(router: &'a dyn RouterHandle) -> Self {
        Self { router }
    }

    /// Returns the codecs the consumer will receive
    pub fn check(
        &self,
        producer: &ProducerSession,
        requested: &RtpCapabilities,
    ) -> SessionResult<Vec<RtpCodecCapability>> {
        if producer.is_closed() {
            return Err(SessionError::not_found("producer", producer.id()));
        }
        let negotiated = negotiate(&self.router.rtp_capabilities(), producer.kind(), requested);
        if negotiated.is_empty() || !self.router.can_consume(producer.id(), requested) {
            return Err(SessionError::NotSupported {
                producer_id: producer.id().to_string(),
            });
        }
        Ok(negotiated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RouterConfig;
    use serde_json::json;

    fn router_caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: RouterConfig::default_codecs(),
            header_extensions: Vec::new(),
        }
    }

    fn requested(codecs: Value) -> RtpCapabilities {
        serde_json::from_value(json!({ "codecs": codecs })).unwrap()
    }

    #[test]
    fn test_shared_codec_is_negotiated() {
        let caps = requested(json!([
            { "kind": "video", "mimeType": "video/vp8", "clockRate": 90000 },
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }
        ]));
        let video = negotiate(&router_caps(), MediaKind::Video, &caps);
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].mime_type, "video/VP8");
        assert!(can_consume(&router_caps(), MediaKind::Audio, &caps));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let audio_only = requested(json!([
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }
        ]));
        assert!(!can_consume(&router_caps(), MediaKind::Video, &audio_only));
    }

    #[test]
    fn test_channel_and_clock_rate_must_match() {
        let mono = requested(json!([
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 }
        ]));
        assert!(!can_consume(&router_caps(), MediaKind::Audio, &mono));

        let wrong_rate = requested(json!([
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 48000 }
        ]));
        assert!(!can_consume(&router_caps(), MediaKind::Video, &wrong_rate));
    }

    #[test]
    fn test_h264_packetization_mode() {
        let mode0 = requested(json!([
            { "kind": "video", "mimeType": "video/H264", "clockRate": 90000,
              "parameters": { "packetization-mode": 0 } }
        ]));
        assert!(!can_consume(&router_caps(), MediaKind::Video, &mode0));

        let mode1 = requested(json!([
            { "kind": "video", "mimeType": "video/H264", "clockRate": 90000,
              "parameters": { "packetization-mode": "1" } }
        ]));
        assert!(can_consume(&router_caps(), MediaKind::Video, &mode1));
    }

    #[test]
    fn test_rtx_alone_does_not_count() {
        let rtx = requested(json!([
            { "kind": "video", "mimeType": "video/rtx", "clockRate": 90000 }
        ]));
        assert!(!can_consume(&router_caps(), MediaKind::Video, &rtx));
        assert!(!can_consume(&router_caps(), MediaKind::Video, &RtpCapabilities::default()));
    }
}
