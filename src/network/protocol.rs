//! Diagnostics Protocol
//!
//! Defines the wire messages exchanged with a stripe server's
//! diagnostics endpoint. Every request is answered by exactly one
//! `Value` or `Error` frame, except `Hello`, which is one-way.

use serde::{Deserialize, Serialize};

/// Protocol messages for the diagnostics channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ========== Session ==========
    /// Announces the connection name right after connect
    Hello {
        connection_name: String,
    },

    // ========== Requests ==========
    /// Ask the server for its logical state (e.g. ACTIVE-COORDINATOR)
    GetState,

    /// Ask the server for its configuration dump
    GetConfig,

    /// Invoke a named operation on a server-side managed object
    Invoke {
        target: String,
        operation: String,
        arg: Option<String>,
    },

    // ========== Responses ==========
    /// Successful response; `None` when the server had nothing to say
    Value {
        value: Option<String>,
    },

    /// Server-side failure
    Error {
        message: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::GetState => "GetState",
            Message::GetConfig => "GetConfig",
            Message::Invoke { .. } => "Invoke",
            Message::Value { .. } => "Value",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from the wire
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
