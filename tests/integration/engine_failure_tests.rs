//! Integration tests for protocol failure semantics.
//!
//! Covers wrong keys, malformed frames written over a raw socket,
//! plaintext error responses, explicit timeout and cancellation, and
//! transport shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use agent_huddle::crypto::cipher::KEY_LEN;
use agent_huddle::crypto::NetworkCipher;
use agent_huddle::rpc::frame::{open_result, Frame};
use agent_huddle::rpc::RejectCalls;
use agent_huddle::AppError;

use super::test_helpers::{engine_with_key, eventually, ScriptedHandler, WAIT};

async fn read_json_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Value {
    let mut line = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut line))
        .await
        .expect("timed out reading frame")
        .expect("read failed");
    serde_json::from_str(&line).expect("response must be json")
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// A peer with a different key is ignored; the caller only gets out via a timeout.
#[tokio::test]
async fn different_keys_cannot_talk() {
    let server = engine_with_key(1);
    let (handler, mut notes) = ScriptedHandler::new();
    let listener = server.serve("127.0.0.1:0", handler).await.unwrap();

    let client = engine_with_key(2);
    let conn = client
        .connect(&listener.local_addr().to_string(), Arc::new(RejectCalls))
        .await
        .unwrap();

    conn.notify("ping", &json!({})).unwrap();
    let err = conn
        .request_with_timeout("echo", json!({"x": 1}), Duration::from_millis(300))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
    assert!(notes.try_recv().is_err(), "undecryptable notification must be dropped");
    assert_eq!(client.pending_requests().await, 0);
    listener.close().await;
}

/// A success response sealed under a foreign key fails the pending request.
#[tokio::test]
async fn undecryptable_response_fails_pending_request() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let foreign = NetworkCipher::new(&[3; KEY_LEN]);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let request = read_json_line(&mut reader).await;
        let id = request["id"].as_str().unwrap().to_owned();
        let reply = Frame::success(&foreign, &id, json!("hidden")).unwrap();
        write
            .write_all(format!("{}\n", reply.to_line().unwrap()).as_bytes())
            .await
            .unwrap();
        // Keep the socket open until the client gives up.
        tokio::time::sleep(WAIT).await;
    });

    let client = engine_with_key(4);
    let conn = client.connect(&addr, Arc::new(RejectCalls)).await.unwrap();

    let err = conn.request("echo", json!({})).await.unwrap_err();

    assert!(matches!(err, AppError::Decryption(_)), "got {err:?}");
    assert_eq!(client.pending_requests().await, 0);
}

// ── Raw wire ────────────────────────────────────────────────────────────────

/// Error responses travel as plaintext strings; results are encrypted.
#[tokio::test]
async fn error_response_is_plaintext_on_the_wire() {
    let server = engine_with_key(5);
    let (handler, _notes) = ScriptedHandler::new();
    let listener = server.serve("127.0.0.1:0", handler).await.unwrap();
    let cipher = NetworkCipher::new(&[5; KEY_LEN]);

    let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let failing = Frame::request(&cipher, "r-fail", "fail", &json!({})).unwrap();
    write
        .write_all(format!("{}\n", failing.to_line().unwrap()).as_bytes())
        .await
        .unwrap();
    let response = read_json_line(&mut reader).await;
    assert_eq!(response["id"], "r-fail");
    assert_eq!(response["error"], "handler: boom");
    assert!(response.get("result").is_none());

    let echo = Frame::request(&cipher, "r-echo", "echo", &json!({"secret": "s3"})).unwrap();
    write
        .write_all(format!("{}\n", echo.to_line().unwrap()).as_bytes())
        .await
        .unwrap();
    let response = read_json_line(&mut reader).await;
    let result = response["result"].clone();
    assert!(result.is_string(), "success results are cipher tokens");
    assert!(!result.as_str().unwrap().contains("s3"));
    assert_eq!(open_result(&cipher, result).unwrap(), json!({"secret": "s3"}));

    listener.close().await;
}

/// Malformed frames get no response and do not kill the connection.
#[tokio::test]
async fn malformed_frames_are_dropped() {
    let server = engine_with_key(6);
    let (handler, _notes) = ScriptedHandler::new();
    let listener = server.serve("127.0.0.1:0", handler).await.unwrap();
    let cipher = NetworkCipher::new(&[6; KEY_LEN]);

    let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let valid = Frame::request(&cipher, "ok-1", "echo", &json!(1)).unwrap();
    let batch = format!(
        "garbage\n[1,2]\n{{\"id\":\"no-payload\"}}\n{{\"id\":\"bad\",\"payload\":\"not-a-token\"}}\n\n{}\n",
        valid.to_line().unwrap()
    );
    write.write_all(batch.as_bytes()).await.unwrap();

    let response = read_json_line(&mut reader).await;
    assert_eq!(response["id"], "ok-1", "only the valid request is answered");
    assert_eq!(server.connections().await.len(), 1);

    listener.close().await;
}

/// An over-long line ends the connection instead of growing the buffer.
#[tokio::test]
async fn over_long_line_closes_connection() {
    let server = engine_with_key(6);
    let (handler, _notes) = ScriptedHandler::new();
    let listener = server.serve("127.0.0.1:0", handler).await.unwrap();

    let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let huge = vec![b'x'; agent_huddle::rpc::codec::MAX_FRAME_BYTES + 16];
    // The server may hang up mid-write.
    let _ = write.write_all(&huge).await;

    let mut line = String::new();
    let read = tokio::time::timeout(WAIT, reader.read_line(&mut line))
        .await
        .expect("server must hang up");
    assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");

    let engine = &server;
    eventually(|| async move { engine.connections().await.is_empty() }).await;
    listener.close().await;
}

/// A response for an id nobody waits for is ignored.
#[tokio::test]
async fn stray_response_is_ignored() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"nobody\",\"error\":\"late\"}\n")
            .await
            .unwrap();
        let request = read_json_line(&mut reader).await;
        let reply = Frame::failure(request["id"].as_str().unwrap(), "still alive");
        write
            .write_all(format!("{}\n", reply.to_line().unwrap()).as_bytes())
            .await
            .unwrap();
        tokio::time::sleep(WAIT).await;
    });

    let conn = engine_with_key(8)
        .connect(&addr, Arc::new(RejectCalls))
        .await
        .unwrap();
    let err = conn.request("anything", json!({})).await.unwrap_err();

    assert_eq!(err, AppError::Remote("still alive".into()));
}

// ── Timeout and cancellation ────────────────────────────────────────────────

/// The timeout variant gives up and forgets its pending entry.
#[tokio::test]
async fn request_with_timeout_cleans_up() {
    let server = engine_with_key(9);
    let (handler, _notes) = ScriptedHandler::new();
    let listener = server.serve("127.0.0.1:0", handler).await.unwrap();
    let client = engine_with_key(9);
    let conn = client
        .connect(&listener.local_addr().to_string(), Arc::new(RejectCalls))
        .await
        .unwrap();

    let err = conn
        .request_with_timeout("hang", json!({}), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(ref msg) if msg.contains("hang")));
    assert_eq!(client.pending_requests().await, 0);

    // The connection is still usable afterwards.
    assert_eq!(conn.request("echo", json!(2)).await.unwrap(), json!(2));
    listener.close().await;
}

/// The cancellable variant stops when its token fires.
#[tokio::test]
async fn request_with_cancel_cleans_up() {
    let server = engine_with_key(9);
    let (handler, _notes) = ScriptedHandler::new();
    let listener = server.serve("127.0.0.1:0", handler).await.unwrap();
    let client = engine_with_key(9);
    let conn = client
        .connect(&listener.local_addr().to_string(), Arc::new(RejectCalls))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = conn
        .request_with_cancel("hang", json!({}), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Cancelled(_)), "got {err:?}");
    assert_eq!(client.pending_requests().await, 0);
    listener.close().await;
}

/// The default request has no deadline: it is still waiting after a while.
#[tokio::test]
async fn default_request_waits_without_deadline() {
    let server = engine_with_key(9);
    let (handler, _notes) = ScriptedHandler::new();
    let listener = server.serve("127.0.0.1:0", handler).await.unwrap();
    let client = engine_with_key(9);
    let conn = client
        .connect(&listener.local_addr().to_string(), Arc::new(RejectCalls))
        .await
        .unwrap();

    let waited = tokio::time::timeout(
        Duration::from_millis(300),
        conn.request("hang", json!({})),
    )
    .await;

    assert!(waited.is_err(), "default request must not time out by itself");
    listener.close().await;
}

// ── Transport shutdown ──────────────────────────────────────────────────────

/// Sending on a closed connection fails with `TransportClosed` and leaves no pending entry.
#[tokio::test]
async fn closed_connection_rejects_sends() {
    let server = engine_with_key(10);
    let listener = server
        .serve("127.0.0.1:0", Arc::new(RejectCalls))
        .await
        .unwrap();
    let client = engine_with_key(10);
    let conn = client
        .connect(&listener.local_addr().to_string(), Arc::new(RejectCalls))
        .await
        .unwrap();

    conn.close();

    assert!(conn.is_closed());
    assert!(matches!(
        conn.notify("ping", &json!({})),
        Err(AppError::TransportClosed(_))
    ));
    assert!(matches!(
        conn.request("echo", json!({})).await,
        Err(AppError::TransportClosed(_))
    ));
    assert_eq!(client.pending_requests().await, 0);
    listener.close().await;
}

/// Closed connections leave both registries; nothing reconnects.
#[tokio::test]
async fn transport_close_prunes_registry() {
    let server = engine_with_key(11);
    let listener = server
        .serve("127.0.0.1:0", Arc::new(RejectCalls))
        .await
        .unwrap();
    let client = engine_with_key(11);
    let conn = client
        .connect(&listener.local_addr().to_string(), Arc::new(RejectCalls))
        .await
        .unwrap();
    let (server_ref, client_ref) = (&server, &client);
    eventually(|| async move { server_ref.connections().await.len() == 1 }).await;

    conn.close();

    eventually(|| async move { client_ref.connections().await.is_empty() }).await;
    eventually(|| async move { server_ref.connections().await.is_empty() }).await;
    listener.close().await;
}

/// Closing a listener closes the connections it accepted.
#[tokio::test]
async fn listener_close_ends_accepted_connections() {
    let server = engine_with_key(12);
    let listener = server
        .serve("127.0.0.1:0", Arc::new(RejectCalls))
        .await
        .unwrap();
    let conn = engine_with_key(12)
        .connect(&listener.local_addr().to_string(), Arc::new(RejectCalls))
        .await
        .unwrap();
    let server_ref = &server;
    eventually(|| async move { server_ref.connections().await.len() == 1 }).await;

    listener.close().await;

    let peer = &conn;
    eventually(|| async move { peer.is_closed() }).await;
}
