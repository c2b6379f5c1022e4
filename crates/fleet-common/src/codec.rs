//! JSON wire codec for relay traffic.
//!
//! Outbound, everything the agent sends is a [`RelayRequest`]; peer-to-peer
//! payloads travel inside it as a [`SignedEnvelope`]. Inbound, a single
//! WebSocket delivery may carry several JSON documents written back to back
//! with no separator, and some of them wrap the real message as a JSON
//! string in a `message` field. [`decode_chunk`] undoes both.

use crate::identity;
use ed25519_dalek::SigningKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes are not valid JSON, or not of the expected shape.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The embedded signature does not verify against the embedded key.
    #[error("signature verification failed")]
    InvalidSignature,
}

/// The logical message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    /// Unix seconds, as a decimal string.
    pub timestamp: String,
    /// Message payload.
    pub content: T,
    /// Sender PeerId.
    pub from: String,
    /// Recipient PeerId, or `None` for a relay-wide message.
    pub to: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    /// Creates an envelope stamped with the current time.
    pub fn new(content: T, from: impl Into<String>, to: Option<String>) -> Self {
        Self {
            timestamp: identity::unix_now().to_string(),
            content,
            from: from.into(),
            to,
        }
    }

    /// Serializes to the canonical string that gets signed.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the content cannot be serialized.
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An envelope's serialized form together with its signature and the
/// signer's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Ed25519 signature over the UTF-8 bytes of `message`.
    pub sign: Vec<u8>,
    /// Signer's raw public key.
    pub public_key: Vec<u8>,
    /// The exact envelope string that was signed.
    pub message: String,
}

impl SignedEnvelope {
    /// Serializes and signs an envelope.
    ///
    /// The serialized string is carried verbatim so that verifiers hash the
    /// same bytes the signer did.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the envelope cannot be serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use fleet_common::codec::{Envelope, SignedEnvelope};
    /// use fleet_common::identity;
    ///
    /// let key = identity::keypair_from_seed(&[1u8; 32]);
    /// let env = Envelope::new(serde_json::json!({"type": "Ping"}), "me", None);
    /// let signed = SignedEnvelope::seal(&env, &key).unwrap();
    /// assert!(signed.verify());
    /// ```
    pub fn seal<T: Serialize>(
        envelope: &Envelope<T>,
        signing_key: &SigningKey,
    ) -> Result<Self, CodecError> {
        let message = envelope.to_json()?;
        let sign = identity::sign(signing_key, message.as_bytes());
        Ok(Self {
            sign: sign.to_vec(),
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
            message,
        })
    }

    /// Checks the signature against the embedded public key.
    #[must_use]
    pub fn verify(&self) -> bool {
        identity::verify(&self.sign, self.message.as_bytes(), &self.public_key)
    }

    /// Verifies, then parses the signed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidSignature`] if verification fails, or
    /// [`CodecError::Json`] if the message is not an envelope of `T`.
    pub fn open<T: DeserializeOwned>(&self) -> Result<Envelope<T>, CodecError> {
        if !self.verify() {
            return Err(CodecError::InvalidSignature);
        }
        Ok(serde_json::from_str(&self.message)?)
    }
}

/// Content addressed through the relay without a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedContent {
    /// Payload.
    pub content: Value,
    /// Recipient PeerId.
    pub to: String,
}

/// An outbound frame addressed to the relay.
///
/// Optional parts are left out of the JSON entirely rather than sent as
/// `null`, matching the sparse shape the relay expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    /// Relay action, e.g. `/send_signed_message`.
    pub action: String,
    /// Unsigned routed content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<RoutedContent>,
    /// Signed peer message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_message: Option<SignedEnvelope>,
    /// Action parameter: own PeerId or owner key depending on the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_param: Option<String>,
}

impl RelayRequest {
    /// Starts a request for `action` with no optional parts.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            content: None,
            signed_message: None,
            action_param: None,
        }
    }

    /// Attaches routed content. Empty objects and `null` are ignored.
    #[must_use]
    pub fn with_content(mut self, content: Value, to: impl Into<String>) -> Self {
        if !is_empty_payload(&content) {
            self.content = Some(RoutedContent {
                content,
                to: to.into(),
            });
        }
        self
    }

    /// Attaches a signed envelope.
    #[must_use]
    pub fn with_signed_message(mut self, signed: SignedEnvelope) -> Self {
        self.signed_message = Some(signed);
        self
    }

    /// Attaches the action parameter. Empty strings are ignored.
    #[must_use]
    pub fn with_action_param(mut self, param: impl Into<String>) -> Self {
        let param = param.into();
        if !param.is_empty() {
            self.action_param = Some(param);
        }
        self
    }

    /// Serializes the request to the JSON text sent on the socket.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Splits one inbound delivery into the messages it carries.
///
/// Documents may be concatenated without separators (`{"a":1}{"b":2}`).
/// A document whose `message` field is a string is replaced by that string
/// parsed as JSON. Any failure rejects the whole chunk so that callers never
/// see a partial delivery.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if any document, or any wrapped `message`
/// string, fails to parse.
///
/// # Examples
///
/// ```
/// let msgs = fleet_common::codec::decode_chunk(r#"{"a":1}{"b":2}"#).unwrap();
/// assert_eq!(msgs, vec![serde_json::json!({"a": 1}), serde_json::json!({"b": 2})]);
/// ```
pub fn decode_chunk(chunk: &str) -> Result<Vec<Value>, CodecError> {
    serde_json::Deserializer::from_str(chunk)
        .into_iter::<Value>()
        .map(|doc| unwrap_message(doc?))
        .collect()
}

fn unwrap_message(doc: Value) -> Result<Value, CodecError> {
    match doc.get("message") {
        Some(Value::String(inner)) => Ok(serde_json::from_str(inner)?),
        _ => Ok(doc),
    }
}
