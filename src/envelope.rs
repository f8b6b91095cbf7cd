//! Wire envelopes.
//!
//! JSON on the wire; byte fields are base64 so any payload codec can ride
//! inside.

use serde::{Deserialize, Serialize};

use crate::handler::HandlerError;

/// Errors encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Envelope encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Envelope decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Malformed response: {0}")]
    Malformed(&'static str),
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// The unit sent on a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    /// Serialized message.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Sanitized routing key of the message type.
    pub routing_type: String,
}

impl Envelope {
    pub fn new(routing_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            body,
            routing_type: routing_type.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// Outcome marker of a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Exception,
}

/// Reply to a remote request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    #[serde(default, with = "base64_opt_bytes")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub exception: Option<HandlerError>,
}

impl ResponseEnvelope {
    /// Successful reply carrying the serialized response.
    pub fn ok(content: Vec<u8>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            content: Some(content),
            exception: None,
        }
    }

    /// Failed reply carrying the handler's error.
    pub fn exception(error: HandlerError) -> Self {
        Self {
            status: ResponseStatus::Exception,
            content: None,
            exception: Some(error),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }

    /// Unwrap into the response bytes or the carried error.
    ///
    /// The outer error is a malformed envelope; the inner one is the
    /// remote handler's failure.
    pub fn into_result(self) -> Result<std::result::Result<Vec<u8>, HandlerError>> {
        match self.status {
            ResponseStatus::Ok => self
                .content
                .map(Ok)
                .ok_or(CodecError::Malformed("Ok response without content")),
            ResponseStatus::Exception => self
                .exception
                .map(Err)
                .ok_or(CodecError::Malformed("Exception response without error")),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
