// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control channel tests for workerbox-protocol.

use workerbox_protocol::frame::{FrameError, read_message};
use workerbox_protocol::{FramedReader, HostMessage, WorkerMessage};

#[tokio::test]
async fn test_reads_messages_written_by_a_foreign_peer() {
    // A unit written in another language only has to print one JSON object per line.
    let raw = b"\n{\"action\":\"ready\",\"address\":\"http://127.0.0.1:9000\"}\n\
{\"action\":\"error\",\"message\":\"boom\"}\n";
    let mut reader = FramedReader::new(&raw[..]);

    let ready: WorkerMessage = reader.recv().await.unwrap();
    assert_eq!(
        ready,
        WorkerMessage::Ready {
            address: "http://127.0.0.1:9000".to_string()
        }
    );

    let error: WorkerMessage = reader.recv().await.unwrap();
    assert!(matches!(error, WorkerMessage::Error { message } if message == "boom"));

    let eof: Result<WorkerMessage, _> = reader.recv().await;
    assert!(matches!(eof, Err(FrameError::ConnectionClosed)));
}

#[tokio::test]
async fn test_garbage_line_is_a_json_error() {
    let mut raw: &[u8] = b"not json\n";
    let result: Result<HostMessage, _> = read_message(&mut raw).await;
    assert!(matches!(result, Err(FrameError::Json(_))));
}

#[tokio::test]
async fn test_last_line_without_newline_is_still_read() {
    let mut raw: &[u8] = br#"{"action":"updateSecrets","secrets":[]}"#;
    let msg: HostMessage = read_message(&mut raw).await.unwrap();
    assert_eq!(msg, HostMessage::UpdateSecrets { secrets: vec![] });
}
