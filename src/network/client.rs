//! Diagnostics Client
//!
//! TCP client for a stripe server's diagnostics endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_message, write_message, Diagnostics, DiagnosticsConnector, Message};
use super::{REQUEST_TIMEOUT, UNKNOWN_RESPONSE};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// One diagnostics connection. Requests are serialized over the stream;
/// after a timeout or I/O failure the stream is dropped and every later
/// request fails with [`Error::NotConnected`] until the owner reconnects.
pub struct TcpDiagnostics {
    address: String,
    stream: Mutex<Option<TcpStream>>,
    request_timeout: Duration,
}

impl TcpDiagnostics {
    /// Connect to `address` and announce the connection name
    pub async fn connect(address: &str, props: &ConnectionConfig) -> Result<Self> {
        let mut stream = connect(address, props.connect_timeout()).await?;

        let hello = Message::Hello {
            connection_name: props.name.clone(),
        };
        match timeout(props.request_timeout(), write_message(&mut stream, &hello)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        }

        Ok(Self {
            address: address.to_string(),
            stream: Mutex::new(Some(stream)),
            request_timeout: props.request_timeout(),
        })
    }

    /// Target address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and wait for its response.
    ///
    /// The stream is taken out of its slot for the exchange and only put
    /// back after a complete response, so a dropped or failed request
    /// never leaves a half-read frame behind.
    async fn request(&self, message: Message) -> Result<String> {
        let mut guard = self.stream.lock().await;
        let mut stream = guard
            .take()
            .ok_or_else(|| Error::NotConnected(self.address.clone()))?;

        let result = timeout(self.request_timeout, async {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &message).await?;
            read_message(&mut reader).await
        })
        .await;

        match result {
            Ok(Ok(Message::Value { value })) => {
                *guard = Some(stream);
                Ok(value.unwrap_or_else(|| UNKNOWN_RESPONSE.to_string()))
            }
            Ok(Ok(Message::Error { message: reason })) => {
                *guard = Some(stream);
                Err(Error::Network(format!(
                    "{} failed on {}: {}",
                    message.type_name(),
                    self.address,
                    reason
                )))
            }
            Ok(Ok(other)) => Err(Error::ProtocolViolation {
                address: self.address.clone(),
                detail: format!("unexpected {} response", other.type_name()),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // The response may still arrive later; the stream cannot be reused
                tracing::debug!("{} to {} timed out", message.type_name(), self.address);
                Ok(REQUEST_TIMEOUT.to_string())
            }
        }
    }
}

#[async_trait]
impl Diagnostics for TcpDiagnostics {
    async fn get_state(&self) -> Result<String> {
        self.request(Message::GetState).await
    }

    async fn get_config(&self) -> Result<String> {
        self.request(Message::GetConfig).await
    }

    async fn invoke(&self, target: &str, operation: &str) -> Result<String> {
        self.request(Message::Invoke {
            target: target.to_string(),
            operation: operation.to_string(),
            arg: None,
        })
        .await
    }

    async fn invoke_with_arg(&self, target: &str, operation: &str, arg: &str) -> Result<String> {
        self.request(Message::Invoke {
            target: target.to_string(),
            operation: operation.to_string(),
            arg: Some(arg.to_string()),
        })
        .await
    }

    async fn close(&self) {
        use tokio::io::AsyncWriteExt;

        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Connector producing [`TcpDiagnostics`] channels
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl DiagnosticsConnector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        props: &ConnectionConfig,
    ) -> Result<Arc<dyn Diagnostics>> {
        let diagnostics = TcpDiagnostics::connect(address, props).await?;
        Ok(Arc::new(diagnostics))
    }
}

/// Connect to an address
async fn connect(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let result = timeout(connect_timeout, TcpStream::connect(address)).await;

    match result {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
    }
}
