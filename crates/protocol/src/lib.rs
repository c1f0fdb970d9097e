use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Wire discriminator carried in the `type` field of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Heartbeat,
    Store,
    Request,
    Replicate,
    Alert,
    Sabotage,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::Store => "STORE",
            MessageKind::Request => "REQUEST",
            MessageKind::Replicate => "REPLICATE",
            MessageKind::Alert => "ALERT",
            MessageKind::Sabotage => "SABOTAGE",
            MessageKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// One slice of a file as it travels in a STORE message and as it is
/// persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub index: u64,
    pub filename: String,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    pub hash: String,
    pub total_chunks: u64,
}

impl ChunkRecord {
    pub fn new(filename: &str, index: u64, total_chunks: u64, data: Vec<u8>) -> Self {
        let hash = content_hash(&data);
        Self {
            id: Self::chunk_id(filename, index),
            index,
            filename: filename.to_string(),
            data,
            hash,
            total_chunks,
        }
    }

    pub fn chunk_id(filename: &str, index: u64) -> String {
        format!("{filename}_{index}")
    }

    /// True when the declared hash matches the payload bytes.
    pub fn is_intact(&self) -> bool {
        content_hash(&self.data) == self.hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub chunk_id: String,
    pub requestor_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertNotice {
    pub culprit: u16,
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat,
    Store(ChunkRecord),
    Request(ChunkRequest),
    Replicate,
    Alert(AlertNotice),
    Sabotage,
    Unknown,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::Store(_) => MessageKind::Store,
            Message::Request(_) => MessageKind::Request,
            Message::Replicate => MessageKind::Replicate,
            Message::Alert(_) => MessageKind::Alert,
            Message::Sabotage => MessageKind::Sabotage,
            Message::Unknown => MessageKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender_port: u16,
    pub message: Message,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} frames cannot be sent")]
    Unsendable(MessageKind),
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    sender_port: u16,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    pub fn new(sender_port: u16, message: Message) -> Self {
        Self {
            sender_port,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = match &self.message {
            Message::Store(record) => serde_json::to_value(record)?,
            Message::Request(request) => serde_json::to_value(request)?,
            Message::Alert(notice) => serde_json::to_value(notice)?,
            Message::Heartbeat | Message::Replicate | Message::Sabotage => {
                serde_json::Value::Null
            }
            Message::Unknown => return Err(ProtocolError::Unsendable(MessageKind::Unknown)),
        };
        let wire = WireEnvelope {
            kind: self.message.kind(),
            sender_port: self.sender_port,
            data,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Payloads of HEARTBEAT, REPLICATE and SABOTAGE are ignored; an
    /// unrecognised `type` decodes to [`Message::Unknown`].
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_slice(frame)?;
        let message = match wire.kind {
            MessageKind::Heartbeat => Message::Heartbeat,
            MessageKind::Store => Message::Store(serde_json::from_value(wire.data)?),
            MessageKind::Request => Message::Request(serde_json::from_value(wire.data)?),
            MessageKind::Replicate => Message::Replicate,
            MessageKind::Alert => Message::Alert(serde_json::from_value(wire.data)?),
            MessageKind::Sabotage => Message::Sabotage,
            MessageKind::Unknown => Message::Unknown,
        };
        Ok(Self {
            sender_port: wire.sender_port,
            message,
        })
    }
}

/// Lowercase hex SHA-256 of the raw bytes.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
