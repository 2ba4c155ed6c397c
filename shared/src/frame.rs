//! WebSocket frames spoken between relay endpoints and their clients.
//!
//! All frames are JSON objects tagged by `type`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::SealedMessage;
use crate::{Error, Result};

/// A sealed message as it travels to and from a relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Recipient identity, hex
    pub recipient: String,
    /// Sealed payload, base64
    pub payload: String,
}

impl WireMessage {
    /// Acknowledgement key: the sealed message id, or a digest of the raw
    /// fields when they do not decode.
    pub fn id(&self) -> String {
        match SealedMessage::try_from(self) {
            Ok(sealed) => sealed.id(),
            Err(_) => {
                let mut hasher = Sha256::new();
                hasher.update(self.recipient.as_bytes());
                hasher.update(b"\n");
                hasher.update(self.payload.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

impl From<&SealedMessage> for WireMessage {
    fn from(message: &SealedMessage) -> Self {
        Self {
            recipient: message.recipient.to_string(),
            payload: STANDARD.encode(&message.payload),
        }
    }
}

impl TryFrom<&WireMessage> for SealedMessage {
    type Error = Error;

    fn try_from(wire: &WireMessage) -> Result<Self> {
        Ok(SealedMessage {
            recipient: wire.recipient.parse()?,
            payload: STANDARD
                .decode(&wire.payload)
                .map_err(|e| Error::Transport(format!("invalid payload encoding: {}", e)))?,
        })
    }
}

/// Client → relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Publish { message: WireMessage },
    Subscribe { sub: String, recipient: String },
    Close { sub: String },
}

/// Relay → client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Publish acknowledgement, keyed by message id
    Ok {
        id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Message { sub: String, message: WireMessage },
    /// Stored backlog for `sub` has been sent; live messages follow
    Eose { sub: String },
    Notice { message: String },
}
