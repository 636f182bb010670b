//! Control-message protocol carried over a peer's signaling channel.
//!
//! One JSON object per logical message, tagged by `type`. Both ends of a
//! session speak the same protocol; the only asymmetric message is `error`,
//! which the server uses to report negotiation failures back to a peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Which half of an offer/answer round a session description carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionRole {
    Offer,
    Answer,
}

/// One side's proposed media/data parameters. Opaque to everything but the
/// transport engine; immutable once created and passed by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub role: DescriptionRole,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            role: DescriptionRole::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            role: DescriptionRole::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.role == DescriptionRole::Offer
    }
}

/// A network-reachability hint for the transport engine, mirroring the shape
/// browsers put on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl CandidateInit {
    /// Some engines signal the end of candidate gathering with an empty
    /// candidate string rather than omitting the field.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

/// Messages exchanged over the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// One negotiation step: a local offer or answer from the sending side.
    SessionDescription { description: SessionDescription },
    /// A reachability hint. `null` is the end-of-candidates marker.
    #[serde(rename = "icecandidate")]
    IceCandidate { candidate: Option<CandidateInit> },
    /// Negotiation or engine failure report.
    Error { message: String },
}

const KNOWN_TYPES: &[&str] = &["sessionDescription", "icecandidate", "error"];

/// Outcome of decoding an inbound frame that was at least valid JSON.
#[derive(Debug)]
pub enum Decoded {
    Control(ControlMessage),
    /// Valid JSON with an unrecognized `type` tag. Logged and ignored by
    /// receivers; never fatal.
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("control message is missing a type tag")]
    MissingType,
}

impl ControlMessage {
    /// Decode one inbound frame.
    ///
    /// Unknown `type` values come back as [`Decoded::Unknown`] so callers can
    /// log and move on; anything that is not a JSON object with a string
    /// `type`, or that carries a known tag with a bad payload, is an error
    /// the caller reports back over the channel.
    pub fn decode(raw: &str) -> Result<Decoded, DecodeError> {
        let value: Value = serde_json::from_str(raw)?;
        match serde_json::from_value::<ControlMessage>(value.clone()) {
            Ok(message) => Ok(Decoded::Control(message)),
            Err(err) => match value.get("type").and_then(Value::as_str) {
                Some(tag) if !KNOWN_TYPES.contains(&tag) => Ok(Decoded::Unknown(tag.to_owned())),
                Some(_) => Err(DecodeError::Malformed(err)),
                None => Err(DecodeError::MissingType),
            },
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlMessage::Error {
            message: message.into(),
        }
    }
}
