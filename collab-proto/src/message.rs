//! Application messages carried by the relay.
//!
//! A [`Message`] is any JSON object. The relay never inspects its fields; the
//! embedding application decides what `{"type": "...", ...}` means.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::CryptoContext;
use crate::error::RelayError;

/// An opaque JSON object exchanged between collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] for arrays, strings, numbers, `null`
    /// and booleans.
    pub fn from_value(value: Value) -> Result<Self, RelayError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(RelayError::Protocol(format!(
                "message must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Sets a field, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Looks up a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow the underlying JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume the message, returning it as a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Serializes the message to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// Parses JSON bytes into a message.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] if the bytes are not valid JSON or
    /// do not describe an object.
    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes and encrypts the message into a token ready for framing.
    ///
    /// # Errors
    ///
    /// Propagates encoding and encryption failures.
    pub fn seal(&self, crypto: &CryptoContext) -> Result<Vec<u8>, RelayError> {
        let plaintext = self.encode()?;
        Ok(crypto.encrypt(&plaintext)?)
    }

    /// Decrypts and parses a token produced by [`Message::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Authentication`] if the token fails
    /// verification, or [`RelayError::Protocol`] if the plaintext is not a
    /// JSON object.
    pub fn open(token: &[u8], crypto: &CryptoContext) -> Result<Self, RelayError> {
        let plaintext = crypto.decrypt(token)?;
        Self::decode(&plaintext)
    }
}

impl TryFrom<Value> for Message {
    type Error = RelayError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        message.into_value()
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
