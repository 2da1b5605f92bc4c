//! IPC stream contract: framing, buffering, and the message sequence a
//! platform receiver observes on the control socket.
//!
//! # Coverage
//! - Lifecycle sequence: server-started, handler-started, log, end arrive
//!   as four NUL-framed JSON messages in emission order.
//! - Pre-ready buffering: logs submitted before server-started drain right
//!   after it, preserving order, ahead of later logs.

use fluid_protocol::{IpcMessage, LogLevel};
use fluid_runtime::ipc::IpcClient;
use fluid_test_utils::MockIpcServer;
use std::time::Duration;

async fn harness() -> (IpcClient, MockIpcServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ipc.sock");
    let server = MockIpcServer::start(&path).await.unwrap();
    let client = IpcClient::connect(&path).await.unwrap();
    (client, server, dir)
}

/// The canonical lifecycle exchange, observed end to end.
#[tokio::test]
async fn lifecycle_sequence_arrives_in_order() {
    let (client, server, _dir) = harness().await;

    client.send_server_started(100, 3000).await.unwrap();
    client
        .send_handler_started("inv-123", 1, 1_704_067_200_000)
        .await
        .unwrap();
    client
        .send_log("inv-123", 1, LogLevel::Info, "test log message")
        .await
        .unwrap();
    client.send_end("inv-123", 1, None).await.unwrap();

    let messages = server.wait_for(4, Duration::from_secs(2)).await;
    assert_eq!(messages.len(), 4);

    match &messages[0] {
        IpcMessage::ServerStarted(p) => {
            assert_eq!(p.init_duration, 100);
            assert_eq!(p.http_port, 3000);
        }
        other => panic!("expected ServerStarted first, got {other:?}"),
    }
    match &messages[1] {
        IpcMessage::HandlerStarted(p) => {
            assert_eq!(p.context.invocation_id, "inv-123");
            assert_eq!(p.context.request_id, 1);
            assert_eq!(p.handler_started_at, 1_704_067_200_000);
        }
        other => panic!("expected HandlerStarted second, got {other:?}"),
    }
    match &messages[2] {
        IpcMessage::Log(p) => {
            // base64("test log message")
            assert_eq!(p.message, "dGVzdCBsb2cgbWVzc2FnZQ==");
            assert_eq!(p.level, Some(LogLevel::Info));
        }
        other => panic!("expected Log third, got {other:?}"),
    }
    match &messages[3] {
        IpcMessage::End(p) => {
            assert_eq!(p.context.invocation_id, "inv-123");
            assert_eq!(p.context.request_id, 1);
            assert!(p.error.is_none());
        }
        other => panic!("expected End fourth, got {other:?}"),
    }
}

/// N logs before server-started plus M after yield "N first, then M".
#[tokio::test]
async fn buffered_logs_drain_before_later_logs() {
    let (client, server, _dir) = harness().await;

    for n in 0..3 {
        client
            .send_log("inv-buf", 1, LogLevel::Info, &format!("early {n}"))
            .await
            .unwrap();
    }
    assert!(server.received().is_empty());

    client.send_server_started(5, 3000).await.unwrap();

    for m in 0..2 {
        client
            .send_log("inv-buf", 1, LogLevel::Info, &format!("late {m}"))
            .await
            .unwrap();
    }

    let messages = server.wait_for(6, Duration::from_secs(2)).await;
    assert!(matches!(messages[0], IpcMessage::ServerStarted(_)));

    let texts: Vec<String> = messages[1..]
        .iter()
        .map(|msg| match msg {
            IpcMessage::Log(log) => log.decoded_message(),
            other => panic!("expected Log, got {other:?}"),
        })
        .collect();
    assert_eq!(texts, ["early 0", "early 1", "early 2", "late 0", "late 1"]);
}

/// Errors on the end message keep their name and message on the wire.
#[tokio::test]
async fn end_carries_the_handler_error() {
    let (client, server, _dir) = harness().await;

    client.send_server_started(1, 1).await.unwrap();
    client
        .send_end(
            "inv-err",
            2,
            Some(fluid_protocol::ErrorInfo::handler_error("panic: boom")),
        )
        .await
        .unwrap();

    let messages = server.wait_for(2, Duration::from_secs(2)).await;
    match &messages[1] {
        IpcMessage::End(p) => {
            let error = p.error.as_ref().expect("end should carry an error");
            assert_eq!(error.name, "Error");
            assert_eq!(error.message, "panic: boom");
        }
        other => panic!("expected End, got {other:?}"),
    }
}
