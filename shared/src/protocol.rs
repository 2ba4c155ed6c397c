//! Tunnel envelope types and codec.
//!
//! Envelopes are UTF-8 JSON carried inside sealed bus messages. Bodies travel
//! base64-encoded on the wire and as raw bytes in memory.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Maximum envelope size accepted by the codec and the relay (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Header mapping carried by requests and responses
pub type Headers = BTreeMap<String, String>;

/// HTTP methods supported by the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(Error::MalformedEnvelope(format!(
                "unsupported method '{}'",
                other
            ))),
        }
    }
}

/// Request envelope: client → agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    #[serde(rename = "v")]
    pub version: u32,
    pub id: String,
    pub method: HttpMethod,
    pub path: String,
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Option<Vec<u8>>,
}

/// Successful response envelope: agent → client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    #[serde(rename = "v")]
    pub version: u32,
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Option<Vec<u8>>,
}

/// Error response envelope: agent → client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelErrorResponse {
    #[serde(rename = "v")]
    pub version: u32,
    pub id: String,
    pub status: u16,
    pub error: String,
}

/// A response is exactly one of the two variants, told apart by `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TunnelResponseMessage {
    Success(TunnelResponse),
    Error(TunnelErrorResponse),
}

impl TunnelRequest {
    /// Build a request with a fresh correlation id. A missing leading `/` is added.
    pub fn new(method: HttpMethod, path: &str, headers: Headers, body: Option<Vec<u8>>) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Self {
            version: PROTOCOL_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            method,
            path,
            headers,
            body,
        }
    }
}

impl TunnelResponse {
    pub fn new(id: impl Into<String>, status: u16, headers: Headers, body: Option<Vec<u8>>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.into(),
            status,
            headers,
            body,
        }
    }

    /// Body as text, replacing invalid UTF-8. Empty when there is no body.
    pub fn body_text(&self) -> String {
        self.body
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }
}

impl TunnelErrorResponse {
    pub fn new(id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.into(),
            status,
            error: error.into(),
        }
    }
}

impl TunnelResponseMessage {
    pub fn id(&self) -> &str {
        match self {
            TunnelResponseMessage::Success(r) => &r.id,
            TunnelResponseMessage::Error(e) => &e.id,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            TunnelResponseMessage::Success(r) => r.status,
            TunnelResponseMessage::Error(e) => e.status,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TunnelResponseMessage::Error(_))
    }
}

impl From<TunnelResponse> for TunnelResponseMessage {
    fn from(r: TunnelResponse) -> Self {
        TunnelResponseMessage::Success(r)
    }
}

impl From<TunnelErrorResponse> for TunnelResponseMessage {
    fn from(e: TunnelErrorResponse) -> Self {
        TunnelResponseMessage::Error(e)
    }
}

/// Serialize any envelope to JSON bytes
pub fn serialize<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse and validate a request envelope
pub fn parse_request(bytes: &[u8]) -> Result<TunnelRequest> {
    check_size(bytes)?;
    Ok(serde_json::from_slice(bytes)?)
}

/// Parse and validate a response envelope, resolving the variant by `error`
pub fn parse_response(bytes: &[u8]) -> Result<TunnelResponseMessage> {
    check_size(bytes)?;
    let value: Value = serde_json::from_slice(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::MalformedEnvelope("response is not an object".into()))?;

    if obj.contains_key("error") {
        if obj.contains_key("headers") || obj.contains_key("body") {
            return Err(Error::MalformedEnvelope(
                "response carries both error and success fields".into(),
            ));
        }
        Ok(TunnelResponseMessage::Error(serde_json::from_value(value)?))
    } else {
        Ok(TunnelResponseMessage::Success(serde_json::from_value(value)?))
    }
}

fn check_size(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "envelope of {} bytes exceeds {} byte limit",
            bytes.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}

/// `Option<Vec<u8>>` as a base64 string or `null`
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
