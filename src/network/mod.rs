//! Network Module
//!
//! The diagnostics transport used to reach stripe servers: a
//! request/response channel per server address. Timeouts are reported
//! in-band with the [`REQUEST_TIMEOUT`] sentinel, which callers translate
//! into [`Error::RequestTimeout`].

pub mod protocol;
mod client;

pub use client::{TcpConnector, TcpDiagnostics};
pub use protocol::{FrameHeader, Message};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Value returned in place of a response when a request times out
pub const REQUEST_TIMEOUT: &str = "Request Timeout";

/// Value returned when the server answered without a payload
pub const UNKNOWN_RESPONSE: &str = "UNKNOWN";

/// An open diagnostics channel to one server
#[async_trait]
pub trait Diagnostics: Send + Sync {
    /// Logical server state, e.g. `ACTIVE-COORDINATOR`
    async fn get_state(&self) -> Result<String>;

    /// Server configuration dump
    async fn get_config(&self) -> Result<String>;

    /// Invoke an operation without an argument
    async fn invoke(&self, target: &str, operation: &str) -> Result<String>;

    /// Invoke an operation with a single string argument
    async fn invoke_with_arg(&self, target: &str, operation: &str, arg: &str) -> Result<String>;

    /// Release the channel; safe to call repeatedly
    async fn close(&self);
}

/// Opens diagnostics channels by address
#[async_trait]
pub trait DiagnosticsConnector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        props: &ConnectionConfig,
    ) -> Result<Arc<dyn Diagnostics>>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
