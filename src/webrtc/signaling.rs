//! Out-of-band signaling codec
//!
//! Offers and answers travel between peers as a single text blob that a
//! human moves by QR code or clipboard. The blob is the JSON object
//! `{"type": "offer" | "answer", "sdp": "<session description>"}` encoded as
//! URL-safe base64 without padding or line wrapping, so it is printable
//! ASCII and safe to render as a QR code.

use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Upper bound on an encoded blob accepted by [`decode`]
pub const MAX_SIGNAL_LEN: usize = 64 * 1024;

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

/// URL-safe alphabet, padding optional
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Standard alphabet, padding optional (blobs produced by other tools)
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

/// Signaling message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
        }
    }

    /// Parse a kind label, ignoring ASCII case
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("offer") {
            Some(SignalKind::Offer)
        } else if s.eq_ignore_ascii_case("answer") {
            Some(SignalKind::Answer)
        } else {
            None
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded signaling message
///
/// The payload is the remote session description exactly as it was encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub payload: String,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn offer(payload: impl Into<String>) -> Self {
        Self::new(SignalKind::Offer, payload)
    }

    pub fn answer(payload: impl Into<String>) -> Self {
        Self::new(SignalKind::Answer, payload)
    }

    /// Encode this message as a transportable blob
    pub fn encode(&self) -> String {
        encode(self.kind, &self.payload)
    }
}

#[derive(Serialize)]
struct WireSignal<'a> {
    #[serde(rename = "type")]
    kind: SignalKind,
    sdp: &'a str,
}

#[derive(Deserialize)]
struct RawSignal {
    #[serde(rename = "type")]
    kind: Option<String>,
    sdp: Option<String>,
}

/// Encode a signaling message as a URL-safe base64 blob
pub fn encode(kind: SignalKind, payload: &str) -> String {
    let wire = WireSignal { kind, sdp: payload };
    // Serializing a two-field struct of plain strings cannot fail
    let json = serde_json::to_vec(&wire).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a blob produced by [`encode`] (or a compatible peer)
///
/// Whitespace anywhere in the input is ignored, since pasted or scanned
/// text is often wrapped. Both base64 alphabets are accepted.
pub fn decode(text: &str) -> Result<SignalMessage> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(AppError::DecodeError("empty signaling text".into()));
    }
    if compact.len() > MAX_SIGNAL_LEN {
        return Err(AppError::DecodeError(format!(
            "signaling text too long ({} > {} bytes)",
            compact.len(),
            MAX_SIGNAL_LEN
        )));
    }

    let bytes = URL_SAFE_LENIENT
        .decode(compact.as_bytes())
        .or_else(|_| STANDARD_LENIENT.decode(compact.as_bytes()))
        .map_err(|e| AppError::DecodeError(format!("invalid base64: {}", e)))?;

    let raw: RawSignal = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::DecodeError(format!("invalid signaling json: {}", e)))?;

    let kind_label = raw
        .kind
        .ok_or_else(|| AppError::DecodeError("missing message type".into()))?;
    let kind = SignalKind::parse(&kind_label).ok_or_else(|| {
        AppError::DecodeError(format!("unknown message type '{}'", kind_label))
    })?;
    let payload = raw
        .sdp
        .ok_or_else(|| AppError::DecodeError("missing session description".into()))?;

    Ok(SignalMessage { kind, payload })
}

/// Decode a blob and require a specific kind
pub fn decode_expecting(text: &str, expected: SignalKind) -> Result<SignalMessage> {
    let msg = decode(text)?;
    if msg.kind != expected {
        return Err(AppError::ValidationError {
            expected,
            found: msg.kind,
        });
    }
    Ok(msg)
}
