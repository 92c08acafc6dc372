//! Wire types for connection-setup signals

use serde::{Deserialize, Serialize};

/// One connection-setup signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// SDP offer
    Offer {
        /// SDP payload
        sdp: String,
    },
    /// SDP answer
    Answer {
        /// SDP payload
        sdp: String,
    },
    /// Trickled ICE candidate
    IceCandidate {
        /// Candidate string
        candidate: String,
        /// Media stream identification tag, if known
        sdp_mid: Option<String>,
        /// Index of the media description the candidate belongs to
        sdp_mline_index: Option<u16>,
    },
}

impl Signal {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice_candidate",
        }
    }
}

/// A signal addressed from one peer to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Sending peer
    pub from: String,
    /// Target peer
    pub to: String,
    /// The signal itself
    #[serde(flatten)]
    pub signal: Signal,
}

impl SignalEnvelope {
    /// Construct an envelope
    pub fn new(from: impl Into<String>, to: impl Into<String>, signal: Signal) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = SignalEnvelope::new(
            "peer-a",
            "peer-b",
            Signal::IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        );

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_tagged_encoding() {
        let envelope = SignalEnvelope::new("a", "b", Signal::Offer { sdp: "v=0".to_string() });
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        assert!(json.contains(r#""from":"a""#));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let result = serde_json::from_str::<SignalEnvelope>(r#"{"type":"offer","from":"a"}"#);
        assert!(result.is_err());
    }
}
