//! JSON-lines TCP link
//!
//! Connects to a frame decoder that owns the serial port of the XBee
//! coordinator. Each line on the socket is one JSON record: decoded API
//! frames flow in, command records flow out.
//!
//! ```text
//! ← {"id":"rx","source_addr_long":"0013a20040401122","rf_data":"temp:21.5\n"}
//! → {"id":"remote_at","dest_addr_long":"0013a20040401122","command":"D3","parameter":"05","frame_id":4}
//! ```

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, RadioLink};
use crate::error::{BridgeError, Result};
use crate::packet::{RadioCommand, RadioPacket};

/// Packets buffered between the socket reader and the bridge
const PACKET_QUEUE_SIZE: usize = 256;

/// TCP link speaking newline-delimited JSON
pub struct TcpLink {
    address: String,
    state: ConnectionState,
    writer: Option<OwnedWriteHalf>,
    packets: Option<mpsc::Receiver<Result<RadioPacket>>>,
    reader: Option<JoinHandle<()>>,
    name: String,
}

impl TcpLink {
    /// Create a new TCP link
    ///
    /// # Arguments
    ///
    /// * `address` - The decoder address (e.g., "127.0.0.1:9750")
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let name = format!("tcp:{}", address);
        Self {
            address,
            state: ConnectionState::Disconnected,
            writer: None,
            packets: None,
            reader: None,
            name,
        }
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

async fn read_records<R>(reader: R, tx: mpsc::Sender<Result<RadioPacket>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RadioPacket>(line) {
                    Ok(packet) => {
                        trace!(?packet, "Decoded radio record");
                        if tx.send(Ok(packet)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let err = BridgeError::InvalidPacket(e.to_string());
                        warn!(code = err.error_code(), error = %err, record = line, "Dropping malformed radio record");
                    }
                }
            }
            Ok(None) => {
                debug!("Radio link closed by peer");
                break;
            }
            Err(e) => {
                // The bridge sees the failure on its next read
                let _ = tx.send(Err(BridgeError::ReadError(e.to_string()))).await;
                break;
            }
        }
    }
}

#[async_trait]
impl RadioLink for TcpLink {
    async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(address = %self.address, "Connecting to radio link");

        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            self.state = ConnectionState::Disconnected;
            BridgeError::LinkConnectFailed {
                link: self.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(PACKET_QUEUE_SIZE);

        self.reader = Some(tokio::spawn(read_records(read_half, tx)));
        self.packets = Some(rx);
        self.writer = Some(write_half);
        self.state = ConnectionState::Connected;

        info!(address = %self.address, "Connected to radio link");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Error shutting down radio link");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.packets = None;
        self.state = ConnectionState::Disconnected;

        info!(address = %self.address, "Disconnected from radio link");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.writer.is_some()
    }

    async fn read_packet(&mut self) -> Result<Option<RadioPacket>> {
        let packets = self.packets.as_mut().ok_or(BridgeError::Disconnected)?;
        match packets.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
            None => {
                self.state = ConnectionState::Disconnected;
                Err(BridgeError::Disconnected)
            }
        }
    }

    async fn send_command(&mut self, command: &RadioCommand) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(BridgeError::Disconnected)?;

        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        debug!(command = %command, "Writing command record");

        writer.write_all(&line).await.map_err(|e| {
            self.state = ConnectionState::Disconnected;
            BridgeError::WriteError(e.to_string())
        })?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink")
            .field("address", &self.address)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_link_name() {
        let link = TcpLink::new("127.0.0.1:9750");
        assert_eq!(link.name(), "tcp:127.0.0.1:9750");
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut link = TcpLink::new(address);
        let err = link.connect().await.unwrap_err();
        assert_eq!(err.error_code(), "LINK_CONNECT_FAILED");
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_exchange_records() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let decoder = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"not json\n{\"id\":\"node_id_indicator\",\"source_addr_long\":\"0013a20040401122\",\"node_id\":\"garden\"}\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap().unwrap()
        });

        let mut link = TcpLink::new(address);
        link.connect().await.unwrap();
        assert!(link.is_connected());

        // The malformed line is skipped
        let packet = link.read_packet().await.unwrap().unwrap();
        assert!(matches!(packet, RadioPacket::NodeIdentification { .. }));

        let command = RadioCommand::At {
            command: "ND".to_string(),
            parameter: None,
            frame_id: 1,
        };
        link.send_command(&command).await.unwrap();

        let written = decoder.await.unwrap();
        let echoed: RadioCommand = serde_json::from_str(&written).unwrap();
        assert_eq!(echoed, command);

        link.disconnect().await.unwrap();
        assert!(!link.is_connected());
    }
}
