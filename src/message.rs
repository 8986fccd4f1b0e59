//! Wire protocol definitions
//!
//! The protocol is one JSON object per line, terminated by a line feed.
//! Handshake and server-minted messages are modeled as Serde tagged enums;
//! relayed payloads stay dynamic (`Msg`) because the server is a blind relay
//! for everything post-join except optional `origin` stamping.

use serde::{Deserialize, Serialize};

use crate::types::ClientId;

/// Line delimiter for all protocol messages.
pub const DELIMITER: u8 = b'\n';

/// Role string for controlling clients.
pub const ROLE_CONTROLLER: &str = "master";
/// Role string for controlled clients.
pub const ROLE_CONTROLLED: &str = "slave";

/// A relayed message: an unordered mapping from short string keys to
/// arbitrary JSON values. No schema is imposed on it.
pub type Msg = serde_json::Map<String, serde_json::Value>;

/// Client → server handshake message
///
/// Everything a client may send before it has joined a channel. Unknown
/// `type` values and malformed lines fail deserialization, which the
/// connection handler answers with the canonical error reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Enter a channel with a role; all subsequent lines are relayed.
    Join {
        channel: String,
        connection_type: String,
    },
    /// Ask the server to mint a fresh channel key.
    GenerateKey,
    /// Declare the client's protocol version (informational).
    ProtocolVersion {
        #[serde(default)]
        version: i64,
    },
}

/// Server → client message
///
/// All messages the server itself originates. Relayed peer traffic does not
/// pass through this type.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a key-mint request
    GenerateKey { key: String },
    /// Join confirmation carrying the role-differing peer snapshot
    ChannelJoined {
        channel: String,
        user_ids: Vec<ClientId>,
        clients: Vec<ClientInfo>,
    },
    /// A peer entered the channel
    ClientJoined {
        user_id: ClientId,
        client: ClientInfo,
    },
    /// A peer left the channel
    ClientLeft {
        user_id: ClientId,
        client: ClientInfo,
    },
    /// Message of the day, sent once right after a join
    Motd { motd: String, force_display: bool },
    /// A controller's message had no eligible recipient
    NvdaNotConnected,
    /// Handshake rejection
    Error { error: ErrorKind },
}

impl ServerMessage {
    /// The canonical handshake rejection reply.
    pub fn invalid_parameters() -> Self {
        Self::Error {
            error: ErrorKind::InvalidParameters,
        }
    }

    /// Encode as a delimited wire line.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(DELIMITER);
        Ok(line)
    }
}

/// Error codes for `ServerMessage::Error`
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed JSON, unknown pre-join type, or empty required fields
    InvalidParameters,
}

/// Client identity as embedded in join/leave notifications.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub connection_type: String,
}
