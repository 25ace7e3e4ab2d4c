//! A pooled connection to one peer container.

use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::codec::{FrameReader, FrameWriter};
use crate::protocol::{Handshake, Message};

/// Write half of a peer connection. The read half is owned by that
/// connection's read loop.
pub struct Connection {
    peer: String,
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
}

impl Connection {
    pub(crate) fn new(peer: impl Into<String>, writer: OwnedWriteHalf) -> Self {
        Self {
            peer: peer.into(),
            writer: Mutex::new(FrameWriter::new(writer)),
        }
    }

    /// Dial `address` and announce `local_address` as the first frame.
    pub(crate) async fn dial(
        address: &str,
        local_address: &str,
        connect_timeout: Duration,
    ) -> Result<(Connection, FrameReader<OwnedReadHalf>)> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Transport(format!("connect to {} timed out", address)))?
            .map_err(|e| Error::Transport(format!("connect to {} failed: {}", address, e)))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let connection = Connection::new(address, write_half);
        connection
            .write(&Handshake {
                identifier: local_address.to_string(),
            })
            .await?;

        tracing::debug!(address, "Connected to peer");
        Ok((connection, FrameReader::new(read_half)))
    }

    /// Read the handshake of an accepted stream and split it.
    pub(crate) async fn accept(
        stream: TcpStream,
        handshake_timeout: Duration,
    ) -> Result<(Connection, FrameReader<OwnedReadHalf>)> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let handshake: Handshake = tokio::time::timeout(handshake_timeout, reader.next_frame())
            .await
            .map_err(|_| Error::Protocol("no handshake received".to_string()))??
            .ok_or_else(|| Error::ConnectionClosed("peer before handshake".to_string()))?;

        Ok((Connection::new(handshake.identifier, write_half), reader))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) async fn send(&self, message: &Message) -> Result<()> {
        self.write(message).await
    }

    async fn write<T: serde::Serialize>(&self, frame: &T) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_frame(frame).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}
