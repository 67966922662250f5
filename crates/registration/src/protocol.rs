//! Wire formats exchanged with the fleet operator.
//!
//! Outbound, a [`RegistrationRequest`] is serialized to JSON and carried as the
//! opaque content of an [`Envelope`]. Inbound, the transport hands back the
//! bytes of a [`ResponseEnvelope`] whose `Body` is itself a JSON
//! [`MessageResponse`].

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::error::{RegistrationError, RegistrationResult};

/// Directive carried by registration and renewal envelopes.
pub const REGISTRATION_DIRECTIVE: &str = "registration";

/// Content of a registration or renewal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistrationRequest {
    /// Hardware facts, opaque to this crate
    pub hardware: serde_json::Value,
    /// PEM-encoded certificate signing request
    pub certificate_request: String,
}

impl RegistrationRequest {
    /// Serialize the request and wrap it in a registration envelope.
    pub fn into_envelope(self) -> RegistrationResult<Envelope> {
        let content = serde_json::to_vec(&self).map_err(|e| {
            RegistrationError::Parse(format!("cannot encode registration request: {}", e))
        })?;
        Ok(Envelope::registration(content))
    }
}

/// Transport-level wrapper around an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per send
    #[serde(rename = "MessageId")]
    pub message_id: String,
    /// Serialized message content
    #[serde(rename = "Content")]
    pub content: Vec<u8>,
    /// Routing directive
    #[serde(rename = "Directive")]
    pub directive: String,
}

impl Envelope {
    /// Build a registration envelope with a freshly generated message id.
    pub fn registration(content: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            content,
            directive: REGISTRATION_DIRECTIVE.to_string(),
        }
    }
}

/// Outer response produced by the transport.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "StatusCode")]
    pub status_code: i64,
    /// Raw JSON body
    #[serde(rename = "Body", default)]
    pub body: Option<Box<RawValue>>,
    /// Metadata added by the transport (HTTP headers for an HTTP transport)
    #[serde(rename = "Metadata", default, deserialize_with = "null_as_empty")]
    pub metadata: HashMap<String, String>,
}

impl ResponseEnvelope {
    /// Parse the outer envelope from raw response bytes.
    pub fn parse(bytes: &[u8]) -> RegistrationResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RegistrationError::Parse(format!("malformed response envelope: {}", e)))
    }

    /// Success iff the status code is below 300.
    pub fn is_success(&self) -> bool {
        self.status_code < 300
    }

    /// The body as raw JSON text, empty when absent.
    pub fn body_text(&self) -> &str {
        self.body.as_deref().map(RawValue::get).unwrap_or("")
    }

    /// Decode the body as a [`MessageResponse`].
    pub fn message(&self) -> RegistrationResult<MessageResponse> {
        let body = self
            .body
            .as_deref()
            .ok_or_else(|| RegistrationError::Parse("response has no body".to_string()))?;
        serde_json::from_str(body.get()).map_err(|e| {
            RegistrationError::Parse(format!(
                "cannot unmarshal registration response content: {}",
                e
            ))
        })
    }
}

/// Inner message carried in the response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(rename = "Directive", alias = "directive", default)]
    pub directive: String,
    #[serde(rename = "MessageID", alias = "message_id", default)]
    pub message_id: String,
    #[serde(rename = "Content", alias = "content", default)]
    pub content: serde_json::Value,
}

impl MessageResponse {
    /// Extract the PEM text of the `certificate` field from the content object.
    pub fn certificate(&self) -> RegistrationResult<&str> {
        let content = self
            .content
            .as_object()
            .ok_or_else(|| RegistrationError::Parse("cannot parse message content".to_string()))?;
        let certificate = content.get("certificate").ok_or_else(|| {
            RegistrationError::Parse("cannot retrieve certificate from response".to_string())
        })?;
        certificate.as_str().ok_or_else(|| {
            RegistrationError::Parse(format!(
                "cannot parse certificate from response content, content={}",
                self.content
            ))
        })
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}
