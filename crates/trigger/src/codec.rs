//! Frame codec.
//!
//! Inbound frames are decoded as JSON when possible. Anything else is kept
//! as a positional character map (`{"0": "a", "1": "b", …}`) so no part of
//! an undecodable payload is lost. Outbound strings go out verbatim; every
//! other value is serialised to JSON text.

use serde_json::{Map, Value};

/// One transport-level message, possibly delivered as several chunks.
///
/// The WebSocket layer reassembles fragmented messages before the connection
/// sees them, so live traffic arrives here as single-chunk frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundFrame {
    chunks: Vec<Vec<u8>>,
}

impl InboundFrame {
    /// A frame made of a single chunk.
    pub fn single(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            chunks: vec![bytes.into()],
        }
    }

    /// A frame made of an ordered sequence of chunks.
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    /// The chunks concatenated into one payload.
    pub fn payload(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

impl From<&str> for InboundFrame {
    fn from(text: &str) -> Self {
        Self::single(text.as_bytes())
    }
}

impl From<Vec<u8>> for InboundFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self::single(bytes)
    }
}

/// The decoded form of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// The payload parsed as JSON.
    Structured(Value),
    /// The payload did not parse; one entry per character, in order.
    Characters(Vec<char>),
}

impl DecodedMessage {
    /// `true` when the payload could not be parsed as JSON.
    pub fn is_fallback(&self) -> bool {
        matches!(self, DecodedMessage::Characters(_))
    }

    /// The JSON value handed to the host.
    pub fn to_value(&self) -> Value {
        match self {
            DecodedMessage::Structured(value) => value.clone(),
            DecodedMessage::Characters(chars) => Value::Object(positional_map(chars)),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            DecodedMessage::Structured(value) => value,
            DecodedMessage::Characters(chars) => Value::Object(positional_map(&chars)),
        }
    }
}

impl From<DecodedMessage> for Value {
    fn from(message: DecodedMessage) -> Self {
        message.into_value()
    }
}

fn positional_map(chars: &[char]) -> Map<String, Value> {
    chars
        .iter()
        .enumerate()
        .map(|(index, ch)| (index.to_string(), Value::String(ch.to_string())))
        .collect()
}

/// Decode a frame: concatenate its chunks, then [`decode_bytes`].
pub fn decode(frame: &InboundFrame) -> DecodedMessage {
    decode_bytes(&frame.payload())
}

/// Decode a complete payload. Never fails.
///
/// Non-JSON UTF-8 text maps one entry per Unicode scalar value. Bytes that
/// are not valid UTF-8 map one entry per byte (Latin-1), so the entry count
/// always matches the input.
pub fn decode_bytes(payload: &[u8]) -> DecodedMessage {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        return DecodedMessage::Structured(value);
    }

    let chars = match std::str::from_utf8(payload) {
        Ok(text) => text.chars().collect(),
        Err(_) => payload.iter().map(|&byte| char::from(byte)).collect(),
    };
    DecodedMessage::Characters(chars)
}

/// Encode an outbound value into the text of a frame.
pub fn encode(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
