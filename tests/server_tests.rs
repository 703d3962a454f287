/*!
 * Integration tests for the mock server: real TCP clients speaking the
 * wire protocol against a live `MockServer`.
 */

use anyhow::Result;
use bson::{doc, Document};
use mongomock::{cleanup, decode_reply, MockError, MockServer, OpCode, ReplyOptions, ServerOptions};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Minimal driver-side client: frames OP_QUERY requests and reads framed
/// replies off the socket.
struct WireClient {
    stream: TcpStream,
}

impl WireClient {
    async fn connect(uri: &str) -> Result<WireClient> {
        let stream = TcpStream::connect(uri).await?;
        Ok(WireClient { stream })
    }

    async fn send_query(&mut self, request_id: i32, namespace: &str, query: &Document) -> Result<()> {
        let bytes = encode_query(request_id, namespace, query);
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one complete framed message.
    async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 4];
        self.stream.read_exact(&mut prefix).await?;
        let declared = i32::from_le_bytes(prefix) as usize;

        let mut message = prefix.to_vec();
        message.resize(declared, 0);
        self.stream.read_exact(&mut message[4..]).await?;
        Ok(message)
    }

    /// Reads whatever arrives until the peer closes the connection.
    async fn read_until_eof(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.stream.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}

fn encode_query(request_id: i32, namespace: &str, query: &Document) -> Vec<u8> {
    let query_bytes = bson::to_vec(query).unwrap();
    let message_length = (16 + 4 + namespace.len() + 1 + 8 + query_bytes.len()) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&message_length.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&2004i32.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(namespace.as_bytes());
    out.push(0);
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&(-1i32).to_le_bytes());
    out.extend_from_slice(&query_bytes);
    out
}

async fn bind_local() -> Result<MockServer> {
    let _ = tracing_subscriber::fmt::try_init();
    Ok(MockServer::bind("127.0.0.1", 0, ServerOptions::default()).await?)
}

#[tokio::test]
async fn ismaster_handshake_round_trip() -> Result<()> {
    // Scenario A: handshake against a fixed port.
    let server = MockServer::bind("localhost", 32010, ServerOptions::default()).await?;
    let mut client = WireClient::connect(&server.uri()).await?;

    client
        .send_query(1, "admin.$cmd", &doc! { "ismaster": true })
        .await?;

    let request = timeout(WAIT, server.receive()).await??;
    assert_eq!(request.opcode(), OpCode::Query);
    let document = request.document().expect("query document");
    assert_eq!(document.get_bool("ismaster")?, true);

    let response = doc! { "ismaster": true, "ok": 1, "maxWireVersion": 5 };
    request.reply(response.clone(), &ReplyOptions::default()).await?;

    let bytes = timeout(WAIT, client.read_message()).await??;
    let reply = decode_reply(&bytes)?;
    assert_eq!(reply.header.response_to, 1);
    assert_eq!(reply.header.request_id, 2);
    assert_eq!(reply.number_returned, 1);
    assert_eq!(reply.documents[0], response);

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn chunked_delivery_produces_one_request() -> Result<()> {
    // Scenario B: a 2000-byte message split into 500/1000/500-byte writes.
    let server = bind_local().await?;
    let mut stream = TcpStream::connect(server.uri()).await?;

    let base = encode_query(7, "db.test", &doc! { "pad": "" }).len();
    let pad = "x".repeat(2000 - base);
    let message = encode_query(7, "db.test", &doc! { "pad": pad.clone() });
    assert_eq!(message.len(), 2000);

    for chunk in [&message[..500], &message[500..1500], &message[1500..]] {
        stream.write_all(chunk).await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let request = timeout(WAIT, server.receive()).await??;
    let document = request.document().expect("query document");
    assert_eq!(document.get_str("pad")?, pad);

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn two_messages_in_one_chunk() -> Result<()> {
    // Scenario C: a single write carrying two complete messages.
    let server = bind_local().await?;
    let mut stream = TcpStream::connect(server.uri()).await?;

    let mut chunk = encode_query(1, "db.a", &doc! { "first": 1 });
    chunk.extend_from_slice(&encode_query(2, "db.b", &doc! { "second": 2 }));
    stream.write_all(&chunk).await?;
    stream.flush().await?;

    let first = timeout(WAIT, server.receive()).await??;
    assert_eq!(first.message().header().request_id, 1);
    assert_eq!(first.document().unwrap().get_i32("first")?, 1);

    let second = timeout(WAIT, server.receive()).await??;
    assert_eq!(second.message().header().request_id, 2);
    assert_eq!(second.document().unwrap().get_i32("second")?, 2);

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn queue_is_fifo_across_connections() -> Result<()> {
    // P4: completion order decides queue order, not accept order.
    let server = bind_local().await?;
    let mut client_a = WireClient::connect(&server.uri()).await?;
    let mut client_b = WireClient::connect(&server.uri()).await?;

    client_a.send_query(10, "db.a", &doc! { "from": "a" }).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client_b.send_query(20, "db.b", &doc! { "from": "b" }).await?;

    let first = timeout(WAIT, server.receive()).await??;
    assert_eq!(first.document().unwrap().get_str("from")?, "a");

    let second = timeout(WAIT, server.receive()).await??;
    assert_eq!(second.document().unwrap().get_str("from")?, "b");

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn destroy_is_idempotent() -> Result<()> {
    // P3.
    let server = bind_local().await?;
    server.destroy().await?;
    server.destroy().await?;

    match server.receive().await {
        Err(MockError::ServerDestroyed) => {}
        other => panic!("expected a destroyed-state error, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[tokio::test]
async fn destroy_closes_live_connections() -> Result<()> {
    let server = bind_local().await?;
    let mut client = WireClient::connect(&server.uri()).await?;
    client.send_query(1, "db.x", &doc! { "ping": 1 }).await?;
    let _request = timeout(WAIT, server.receive()).await??;

    server.destroy().await?;

    let leftover = timeout(WAIT, client.read_until_eof()).await??;
    assert!(leftover.is_empty());
    Ok(())
}

#[tokio::test]
async fn partial_write_fault_injection() -> Result<()> {
    // P5: exactly N bytes on the wire, then a hard close.
    let server = bind_local().await?;
    let mut client = WireClient::connect(&server.uri()).await?;
    client.send_query(5, "db.x", &doc! { "find": "x" }).await?;

    let request = timeout(WAIT, server.receive()).await??;
    let options = ReplyOptions {
        kill_connection_after_n_bytes: Some(25),
        ..Default::default()
    };
    request
        .reply(doc! { "ok": 1, "padding": "some longer payload" }, &options)
        .await?;

    let bytes = timeout(WAIT, client.read_until_eof()).await??;
    assert_eq!(bytes.len(), 25);
    assert!(request.connection().is_closed());

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn connection_destroy_simulates_partition() -> Result<()> {
    let server = bind_local().await?;
    let mut client = WireClient::connect(&server.uri()).await?;
    client.send_query(3, "db.x", &doc! { "ping": 1 }).await?;

    let request = timeout(WAIT, server.receive()).await??;
    request.connection().destroy().await;

    let bytes = timeout(WAIT, client.read_until_eof()).await??;
    assert!(bytes.is_empty());

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn corrupt_length_is_reported_not_fatal() -> Result<()> {
    // P6: an oversized declared length surfaces as a diagnostic and leaves
    // the server usable for well-formed traffic.
    let server = bind_local().await?;

    let mut bad = TcpStream::connect(server.uri()).await?;
    let declared: i32 = 50 * 1024 * 1024;
    let mut junk = declared.to_le_bytes().to_vec();
    junk.extend_from_slice(b"garbage");
    bad.write_all(&junk).await?;
    bad.flush().await?;

    let event = timeout(WAIT, server.parse_error())
        .await?
        .expect("parse error event");
    assert!(matches!(event.error, MockError::Frame(_)));
    assert_eq!(event.bin.as_ref(), junk.as_slice());

    // A fresh connection still round-trips.
    let mut client = WireClient::connect(&server.uri()).await?;
    client.send_query(9, "db.ok", &doc! { "ping": 1 }).await?;
    let request = timeout(WAIT, server.receive()).await??;
    assert_eq!(request.document().unwrap().get_i32("ping")?, 1);

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn per_command_handler_bypasses_queue() -> Result<()> {
    let server = bind_local().await?;
    server.add_message_handler("ismaster", |request| async move {
        let response = doc! { "ismaster": true, "ok": 1 };
        let _ = request.reply(response, &ReplyOptions::default()).await;
    });

    let mut client = WireClient::connect(&server.uri()).await?;
    client
        .send_query(1, "admin.$cmd", &doc! { "ismaster": 1 })
        .await?;

    let bytes = timeout(WAIT, client.read_message()).await??;
    let reply = decode_reply(&bytes)?;
    assert_eq!(reply.documents[0].get_bool("ismaster")?, true);

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn generic_handler_receives_every_request() -> Result<()> {
    let server = bind_local().await?;
    server.set_message_handler(|request| async move {
        let _ = request
            .reply(doc! { "handled": true, "ok": 1 }, &ReplyOptions::default())
            .await;
    });

    let mut client = WireClient::connect(&server.uri()).await?;
    for (id, command) in [(1, "ping"), (2, "whatsmyuri")] {
        let mut query = Document::new();
        query.insert(command, 1);
        client.send_query(id, "admin.$cmd", &query).await?;
        let bytes = timeout(WAIT, client.read_message()).await??;
        let reply = decode_reply(&bytes)?;
        assert_eq!(reply.header.response_to, id);
        assert_eq!(reply.documents[0].get_bool("handled")?, true);
    }

    server.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn cleanup_tears_down_all_servers() -> Result<()> {
    let first = bind_local().await?;
    let second = bind_local().await?;

    {
        let mut client = WireClient::connect(&first.uri()).await?;
        client.send_query(1, "db.x", &doc! { "ping": 1 }).await?;
        let _ = timeout(WAIT, first.receive()).await??;
        // Client drops here, draining the connection.
    }

    cleanup(vec![first.clone(), second.clone()]).await?;

    for server in [first, second] {
        match server.receive().await {
            Err(MockError::ServerDestroyed) => {}
            other => panic!("expected a destroyed-state error, got {:?}", other.map(|_| ())),
        }
    }
    Ok(())
}

#[tokio::test]
async fn multiple_replies_with_cursor_metadata() -> Result<()> {
    // P2 over the wire: batch reply with cursor id and flags intact.
    let server = bind_local().await?;
    let mut client = WireClient::connect(&server.uri()).await?;
    client.send_query(11, "db.items", &doc! { "find": "items" }).await?;

    let request = timeout(WAIT, server.receive()).await??;
    let batch = vec![doc! { "_id": 1 }, doc! { "_id": 2 }, doc! { "_id": 3 }];
    let options = ReplyOptions {
        cursor_id: 99,
        response_flags: mongomock::response_flags::AWAIT_CAPABLE,
        starting_from: 0,
        kill_connection_after_n_bytes: None,
    };
    request.reply(batch.clone(), &options).await?;

    let bytes = timeout(WAIT, client.read_message()).await??;
    let reply = decode_reply(&bytes)?;
    assert_eq!(reply.cursor_id, 99);
    assert_eq!(reply.response_flags, mongomock::response_flags::AWAIT_CAPABLE);
    assert_eq!(reply.number_returned, 3);
    assert_eq!(reply.documents, batch);

    server.destroy().await?;
    Ok(())
}
