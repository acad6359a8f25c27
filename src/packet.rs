//! Wire packet type.
//!
//! Every exchange between peers is a single JSON object serialized on one
//! line and terminated with a newline:
//!
//! ```json
//! {"id":1700000000000,"type":"peerlink.ping","body":{}}
//! ```
//!
//! `id` is the construction time in UNIX epoch milliseconds. Some older
//! peers transmit it as a decimal string, so deserialization accepts both
//! forms. Binary payloads travel out of band and are correlated to their
//! packet through `payloadSize`/`payloadTransferInfo`.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};

/// A protocol packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// Millisecond timestamp assigned at construction.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,

    /// Reverse-DNS packet type, e.g. `peerlink.notification`.
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Type-specific payload. Always a JSON object.
    pub body: Value,

    /// Size of the out-of-band binary payload, if one accompanies this
    /// packet.
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Transport hints for fetching the payload (e.g. a port number).
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

/// Accept the id as either a JSON number or a decimal string.
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdValue {
        Number(i64),
        String(String),
    }

    match IdValue::deserialize(deserializer)? {
        IdValue::Number(n) => Ok(n),
        IdValue::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

impl Packet {
    /// Create a packet with the current timestamp as its id.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Create a packet with an explicit id. Mainly useful in tests and when
    /// re-synthesizing packets from received fragments.
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Set a field on the body, consuming and returning the packet.
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Serialize to the newline-terminated wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse a packet from wire bytes, tolerating `\n`, `\r\n`, or no
    /// terminator.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::InvalidPacket(format!("invalid UTF-8: {}", e)))?;
        let trimmed = text.trim_end_matches(['\r', '\n']);
        let packet: Packet = serde_json::from_str(trimmed)?;
        if !packet.body.is_object() {
            return Err(ProtocolError::InvalidPacket(
                "packet body must be a JSON object".to_string(),
            ));
        }
        Ok(packet)
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Typed body accessor with soft-absence semantics: a missing or null
    /// field is `Ok(None)`, a present field of the wrong shape is an
    /// `InvalidField` error.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.body.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|_| {
                ProtocolError::InvalidField {
                    key: key.to_string(),
                    expected: std::any::type_name::<T>(),
                }
            }),
        }
    }

    /// Boolean flag accessor. Absent means `false`. Some peers encode flags
    /// as the strings `"true"`/`"false"`, so both forms are accepted.
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.body.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s == "true" => Ok(true),
            Some(Value::String(s)) if s == "false" => Ok(false),
            Some(_) => Err(ProtocolError::InvalidField {
                key: key.to_string(),
                expected: "boolean",
            }),
        }
    }
}
