//! Transport layer - framed byte stream to a language server
//!
//! This module owns the two halves of the server's stdio (or any other
//! `AsyncRead`/`AsyncWrite` pair). Outgoing message bodies are queued on a
//! channel and written by a dedicated writer task, so any number of senders
//! can enqueue without waiting on each other. Incoming frames are decoded
//! lazily by whoever owns the [`TransportReceiver`] (the RPC read loop).

use futures::{SinkExt, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, trace};

use crate::lsp::framing::{FramingError, LspCodec};

type BoxedReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Error types for the transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Transport is disconnected")]
    Disconnected,
}

/// Commands consumed by the writer task
#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

/// Bidirectional framed transport over a reader/writer pair
pub struct StdioTransport {
    sender: TransportSender,
    receiver: TransportReceiver,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("connected", &self.sender.is_connected())
            .finish()
    }
}

impl StdioTransport {
    /// Create a transport from any stream pair
    ///
    /// Spawns the writer task immediately, so this must be called from
    /// within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::writer_task(
            FramedWrite::new(writer, LspCodec::new()),
            outbound_rx,
            Arc::clone(&connected),
        ));

        let reader: BoxedReader = Box::pin(reader);

        Self {
            sender: TransportSender {
                outbound: outbound_tx,
                connected,
            },
            receiver: TransportReceiver {
                frames: FramedRead::new(reader, LspCodec::new()),
                finished: false,
            },
        }
    }

    /// Create a transport from child process streams
    pub fn from_child(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }

    /// Split into the sending half (cloneable) and the receiving half
    pub fn split(self) -> (TransportSender, TransportReceiver) {
        (self.sender, self.receiver)
    }

    /// Background task that writes framed messages
    async fn writer_task<W>(
        mut writer: FramedWrite<W, LspCodec>,
        mut receiver: mpsc::UnboundedReceiver<Outbound>,
        connected: Arc<AtomicBool>,
    ) where
        W: AsyncWrite + Send + Unpin,
    {
        while let Some(command) = receiver.recv().await {
            match command {
                Outbound::Frame(message) => {
                    trace!(
                        "StdioTransport: Writing message (length: {})",
                        message.len()
                    );
                    if let Err(e) = writer.send(message).await {
                        error!("Failed to write to server input: {}", e);
                        break;
                    }
                }
                Outbound::Close => {
                    trace!("StdioTransport: close requested");
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        if let Err(e) = writer.close().await {
            trace!("StdioTransport: error while closing server input: {}", e);
        }

        trace!("StdioTransport: writer task finished");
    }
}

/// Sending half of the transport
///
/// Cheap to clone; every clone feeds the same writer task.
#[derive(Debug, Clone)]
pub struct TransportSender {
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
}

impl TransportSender {
    /// Queue one message body for framing and writing
    pub fn send(&self, message: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        self.outbound
            .send(Outbound::Frame(message))
            .map_err(|_| TransportError::Disconnected)
    }

    /// Flush queued messages, then close the server's input stream
    pub fn close(&self) {
        // Frames queued before this point are still written
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Check if the writer is still accepting messages
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

/// Receiving half of the transport
pub struct TransportReceiver {
    frames: FramedRead<BoxedReader, LspCodec>,
    finished: bool,
}

impl TransportReceiver {
    /// Wait for the next complete message body
    ///
    /// Returns `Ok(None)` once the server closed its output stream.
    pub async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        if self.finished {
            return Ok(None);
        }

        match self.frames.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => {
                self.finished = true;
                Err(TransportError::Framing(e))
            }
            None => {
                trace!("StdioTransport: server output reached EOF");
                self.finished = true;
                Ok(None)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::process::Command;

    #[tokio::test]
    async fn test_send_writes_framed_message() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (sender, _receiver) = StdioTransport::new(client_read, client_write).split();

        sender.send(r#"{"jsonrpc":"2.0"}"#.to_string()).unwrap();
        sender.close();

        let mut written = String::new();
        server_side.read_to_string(&mut written).await.unwrap();

        assert_eq!(written, "Content-Length: 17\r\n\r\n{\"jsonrpc\":\"2.0\"}");
    }

    #[tokio::test]
    async fn test_receive_handles_chunked_input_and_eof() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (_sender, mut receiver) = StdioTransport::new(client_read, client_write).split();

        let body = r#"{"jsonrpc":"2.0","method":"window/logMessage"}"#;
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);

        tokio::spawn(async move {
            for chunk in framed.as_bytes().chunks(7) {
                server_side.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            server_side.shutdown().await.unwrap();
        });

        assert_eq!(receiver.receive().await.unwrap().as_deref(), Some(body));
        assert!(receiver.receive().await.unwrap().is_none());
        assert!(receiver.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (client_side, _server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (sender, _receiver) = StdioTransport::new(client_read, client_write).split();

        sender.close();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!sender.is_connected());
        assert!(matches!(
            sender.send("{}".to_string()),
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_child_process_echo_roundtrip() {
        // cat echoes our framed output back as its own stdout
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let (sender, mut receiver) = StdioTransport::from_child(stdin, stdout).split();

        sender.send(r#"{"id":1}"#.to_string()).unwrap();
        assert_eq!(receiver.receive().await.unwrap().as_deref(), Some(r#"{"id":1}"#));

        sender.close();
        assert!(receiver.receive().await.unwrap().is_none());
        let _ = child.wait().await;
    }
}
