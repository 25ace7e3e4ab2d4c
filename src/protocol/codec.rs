//! Newline-delimited JSON framing.
//!
//! One frame per line. Compact `serde_json` output never contains a raw
//! newline, so the line break is an unambiguous delimiter. Lines are read as
//! raw bytes: a line that is not UTF-8 or not JSON fails to decode on its own
//! and the next line is read normally.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{Error, Result};

/// Upper bound on a single frame, excluding the newline.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Serialize a frame, including the trailing newline.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a frame.
pub fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    if line.len() > MAX_FRAME_BYTES + 1 {
        return Err(Error::Protocol(format!(
            "frame too large: max {} got {}",
            MAX_FRAME_BYTES,
            line.len()
        )));
    }
    Ok(serde_json::from_slice(line)?)
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame(reader, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(reader: R, max_frame: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame,
        }
    }

    /// Next raw line, newline included. `Ok(None)` means the peer closed the
    /// stream.
    ///
    /// At most `max_frame + 1` bytes are buffered. A longer line is skipped up
    /// to its newline and reported as `Error::Protocol`; the reader stays
    /// usable. I/O failures come back as `Error::Io`.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let mut line = Vec::new();
            let limit = self.max_frame as u64 + 1;
            let read = (&mut self.reader).take(limit).read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Ok(None);
            }

            if line.last() != Some(&b'\n') && line.len() > self.max_frame {
                let skipped = self.skip_line().await?;
                return Err(Error::Protocol(format!(
                    "frame too large: max {} got {}",
                    self.max_frame,
                    line.len() + skipped
                )));
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    /// Discard input through the next newline without buffering it.
    async fn skip_line(&mut self) -> Result<usize> {
        let mut skipped = 0;
        loop {
            let (used, done) = {
                let chunk = self.reader.fill_buf().await?;
                match chunk.iter().position(|b| *b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (chunk.len(), chunk.is_empty()),
                }
            };
            self.reader.consume(used);
            skipped += used;
            if done {
                return Ok(skipped);
            }
        }
    }

    /// Next decoded frame. A decode failure is returned as an error but leaves
    /// the reader usable for the following line.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next_line().await? {
            Some(line) => decode_frame(&line).map(Some),
            None => Ok(None),
        }
    }
}

pub struct FrameWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let line = encode_frame(frame)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Handshake, Message};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_frame(&Handshake {
                identifier: "localhost:8081".to_string(),
            })
            .await
            .unwrap();
        writer.write_frame(&Message::mail("line\nbreak")).await.unwrap();
        drop(writer);

        let handshake: Handshake = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(handshake.identifier, "localhost:8081");
        let message: Message = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(message.content, "line\nbreak");
        assert!(reader.next_frame::<Message>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_poison_reader() {
        let (mut client, server) = tokio::io::duplex(4096);
        let good = encode_frame(&Message::mail("after")).unwrap();
        client.write_all(b"{not json}\n").await.unwrap();
        client.write_all(good.as_bytes()).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(reader.next_frame::<Message>().await.is_err());
        let message: Message = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(message.content, "after");
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_a_decode_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let good = encode_frame(&Message::mail("after")).unwrap();
        client.write_all(b"\xff\xfe\xfd\n").await.unwrap();
        client.write_all(good.as_bytes()).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        let line = reader.next_line().await.unwrap().unwrap();
        assert!(matches!(decode_frame::<Message>(&line), Err(Error::Json(_))));
        let message: Message = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(message.content, "after");
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped_without_buffering() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let good = encode_frame(&Message::mail("after")).unwrap();
        let mut reader = FrameReader::with_max_frame(server, 256);

        let writer = tokio::spawn(async move {
            client.write_all(&vec![b'x'; 10_000]).await.unwrap();
            client.write_all(b"\n").await.unwrap();
            client.write_all(good.as_bytes()).await.unwrap();
        });

        match reader.next_line().await {
            Err(Error::Protocol(reason)) => assert!(reason.contains("10001"), "{}", reason),
            other => panic!("expected frame too large, got {:?}", other.map(|l| l.map(|l| l.len()))),
        }
        let message: Message = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(message.content, "after");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let (mut client, server) = tokio::io::duplex(4096);
        let frame = encode_frame(&Message::mail("edge")).unwrap();
        let max = frame.len() - 1;
        client.write_all(frame.as_bytes()).await.unwrap();
        client.write_all(frame.as_bytes()).await.unwrap();
        drop(client);

        let mut reader = FrameReader::with_max_frame(server, max);
        for _ in 0..2 {
            let message: Message = reader.next_frame().await.unwrap().unwrap();
            assert_eq!(message.content, "edge");
        }
        assert!(reader.next_frame::<Message>().await.unwrap().is_none());
    }
}
