use patchflow::events::{EventType, PatchEvent};
use patchflow::hub::auth::StaticTokenVerifier;
use patchflow::hub::protocol::{Envelope, Outbound};
use patchflow::hub::{BroadcastFilter, ConnectionHub};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

/// duplex 위에 등록된 테스트 클라이언트
struct Client {
    id: String,
    lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
    writer: tokio::io::WriteHalf<DuplexStream>,
}

impl Client {
    async fn connect(hub: &Arc<ConnectionHub>) -> Self {
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (client_read, writer) = tokio::io::split(client_side);

        let id = hub.register(server_read, server_write, Map::new()).await.unwrap();
        let mut client = Self {
            id,
            lines: BufReader::new(client_read).lines(),
            writer,
        };

        let welcome = client.recv().await;
        assert_eq!(welcome["payload"]["event"], "connected");
        assert_eq!(welcome["payload"]["connectionId"], client.id.as_str());
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn request(&mut self, line: &str) -> Value {
        self.send(line).await;
        self.recv().await
    }

    async fn subscribe(&mut self, channel: &str) {
        let reply = self
            .request(&format!(
                r#"{{"id":"sub","type":"subscribe","payload":{{"channel":"{}"}}}}"#,
                channel
            ))
            .await;
        assert_eq!(reply["payload"]["status"], "subscribed");
    }

    /// 짧은 시간 안에 아무것도 오지 않아야 함
    async fn assert_silent(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.lines.next_line()).await;
        assert!(next.is_err(), "unexpected message: {:?}", next);
    }
}

#[tokio::test]
async fn test_five_subscribers_receive_event_once() {
    let hub = Arc::new(ConnectionHub::default());
    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = Client::connect(&hub).await;
        client.subscribe("patch-events").await;
        clients.push(client);
    }

    let event = PatchEvent::new("p9", EventType::PatchProcessingCompleted, Map::new());
    assert_eq!(hub.broadcast_event(&event).await, 5);

    for client in &mut clients {
        let message = client.recv().await;
        assert_eq!(message["type"], "event");
        assert_eq!(message["payload"]["data"]["patchId"], "p9");
        client.assert_silent().await;
    }
}

#[tokio::test]
async fn test_channel_broadcast_isolation() {
    let hub = Arc::new(ConnectionHub::default());
    let mut a = Client::connect(&hub).await;
    let mut b = Client::connect(&hub).await;
    a.subscribe("x").await;

    let delivered = hub
        .broadcast(Envelope::event(json!({"hello": 1})), BroadcastFilter::channel("x"))
        .await;

    assert_eq!(delivered, 1);
    assert_eq!(a.recv().await["payload"]["hello"], 1);
    b.assert_silent().await;
}

#[tokio::test]
async fn test_failed_send_removes_only_that_connection() {
    let hub = Arc::new(ConnectionHub::default());

    let (tx, rx) = tokio::sync::mpsc::channel::<Outbound>(8);
    let broken = hub.attach(tx, Map::new()).await.unwrap();
    hub.handle_message(&broken, r#"{"id":"1","type":"subscribe","payload":{"channel":"x"}}"#)
        .await;
    drop(rx);

    let mut b = Client::connect(&hub).await;
    assert_eq!(hub.connection_count().await, 2);

    let delivered = hub
        .broadcast(Envelope::event(json!({})), BroadcastFilter::channel("x"))
        .await;

    assert_eq!(delivered, 0);
    assert!(hub.connection(&broken).await.is_none());
    assert!(hub.connection(&b.id).await.is_some());
    b.assert_silent().await;
}

#[tokio::test]
async fn test_malformed_messages_get_error_replies() {
    let hub = Arc::new(ConnectionHub::default());
    let mut client = Client::connect(&hub).await;

    let reply = client.request("this is not json").await;
    assert_eq!(reply["payload"]["status"], "error");
    assert_eq!(reply["payload"]["code"], "invalid_json");

    let reply = client.request(r#"{"id":"7","type":"teleport","payload":{}}"#).await;
    assert_eq!(reply["id"], "7");
    assert_eq!(reply["payload"]["code"], "unknown_type");

    // 연결은 그대로 유지
    let reply = client.request(r#"{"id":"8","type":"data","payload":{"n":1}}"#).await;
    assert_eq!(reply["payload"], json!({"ack": true, "echo": {"n": 1}}));
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn test_auth_then_targeted_delivery() {
    let verifier = StaticTokenVerifier::default().with_token("secret", "alice");
    let hub = Arc::new(ConnectionHub::new(Arc::new(verifier), 16));
    let mut alice = Client::connect(&hub).await;
    let mut other = Client::connect(&hub).await;

    let reply = alice
        .request(r#"{"id":"a","type":"auth","payload":{"token":"secret"}}"#)
        .await;
    assert_eq!(reply["payload"]["status"], "authenticated");
    assert_eq!(reply["payload"]["userId"], "alice");

    let delivered = hub
        .broadcast(
            Envelope::event(json!({"for": "alice"})),
            BroadcastFilter::default().for_user("alice"),
        )
        .await;
    assert_eq!(delivered, 1);
    assert_eq!(alice.recv().await["payload"]["for"], "alice");
    other.assert_silent().await;
}

#[tokio::test]
async fn test_per_connection_fifo() {
    let hub = Arc::new(ConnectionHub::default());
    let mut client = Client::connect(&hub).await;

    for n in 0..20 {
        assert!(hub.send_message(&client.id, Envelope::event(json!({"n": n}))).await);
    }
    for n in 0..20 {
        assert_eq!(client.recv().await["payload"]["n"], n);
    }
}

#[tokio::test]
async fn test_client_disconnect_unregisters() {
    let hub = Arc::new(ConnectionHub::default());
    let client = Client::connect(&hub).await;
    let id = client.id.clone();
    drop(client);

    for _ in 0..50 {
        if hub.connection(&id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection {} was not removed after disconnect", id);
}

#[tokio::test]
async fn test_shutdown_sends_normal_close() {
    let hub = Arc::new(ConnectionHub::default());
    let mut client = Client::connect(&hub).await;

    assert_eq!(hub.shutdown().await, 1);

    let close = client.recv().await;
    assert_eq!(close["payload"]["event"], "close");
    assert_eq!(close["payload"]["code"], 1000);
    assert_eq!(hub.connection_count().await, 0);
}
