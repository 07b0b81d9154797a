// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for the control channel.
//!
//! Each message is one JSON document followed by `\n`. serde_json never emits
//! raw newlines inside a document, so a line is always a whole message.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Maximum size of a single message line (64 MB).
/// Bounded so a misbehaving peer cannot make the reader buffer without limit.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    /// The message exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    /// Reading or writing the underlying stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The line was not a valid message.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer closed its end of the stream.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Encode a message as a single line.
pub fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(msg)?;
    if buf.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(buf.len()));
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Write a message to an async writer and flush it.
pub async fn write_message<W: AsyncWrite + Unpin, M: Serialize>(
    writer: &mut W,
    msg: &M,
) -> Result<(), FrameError> {
    let encoded = encode(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message from a buffered reader.
///
/// Blank lines are skipped. Returns [`FrameError::ConnectionClosed`] on EOF.
pub async fn read_message<R: AsyncBufRead + Unpin, M: DeserializeOwned>(
    reader: &mut R,
) -> Result<M, FrameError> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if line.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(line.len()));
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(serde_json::from_slice(&line)?);
    }
}

/// Reading half of a framed control channel.
pub struct FramedReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wrap a raw reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next message.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<M, FrameError> {
        read_message(&mut self.reader).await
    }

    /// Unwrap the inner reader.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

/// Writing half of a framed control channel.
pub struct FramedWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Wrap a raw writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one message.
    pub async fn send<M: Serialize>(&mut self, msg: &M) -> Result<(), FrameError> {
        write_message(&mut self.writer, msg).await
    }

    /// Unwrap the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostMessage, SecretEntry, WorkerMessage};

    #[test]
    fn test_encode_appends_newline() {
        let bytes = encode(&WorkerMessage::Ready {
            address: "http://127.0.0.1:1".into(),
        })
        .unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_multiline_content_stays_on_one_line() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWriter::new(client);
        let mut reader = FramedReader::new(server);

        let msg = HostMessage::RunScript {
            script: crate::ScriptPayload::new("demo", "id", "line one\nline two\n"),
        };
        writer.send(&msg).await.unwrap();
        writer
            .send(&HostMessage::UpdateSecrets {
                secrets: vec![SecretEntry::new("A", "1")],
            })
            .await
            .unwrap();

        let first: HostMessage = reader.recv().await.unwrap();
        assert_eq!(first, msg);
        let second: HostMessage = reader.recv().await.unwrap();
        assert!(matches!(second, HostMessage::UpdateSecrets { .. }));
    }

    #[tokio::test]
    async fn test_eof_reports_connection_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FramedReader::new(server);
        let result: Result<WorkerMessage, _> = reader.recv().await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
