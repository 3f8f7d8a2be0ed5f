//! Live subscriber connections.
//!
//! The hub owns every connection for its whole lifetime. Each connection is
//! an actor: one reader task feeds inbound lines to
//! [`ConnectionHub::handle_message`], one writer task drains a bounded
//! outbound queue. Sending never touches the transport directly, so a slow or
//! dead peer can only ever fail its own queue.
//!
//! Delivery is best effort. A send that finds the queue closed or full
//! removes that connection and moves on to the next one.

pub mod auth;
pub mod connection;
pub mod protocol;
pub mod server;

use crate::error::{PatchError, Result};
use crate::events::{EventBroadcast, PatchEvent};
use async_trait::async_trait;
use auth::{StaticTokenVerifier, TokenVerifier};
use connection::{Connection, Transition};
use protocol::{Envelope, Inbound, Outbound, Request, CLOSE_GOING_AWAY, CLOSE_NORMAL};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Duration, Instant};

/// 모든 패치 이벤트가 가는 채널
pub const PATCH_EVENTS_CHANNEL: &str = "patch-events";

/// 이벤트가 전달되는 채널 목록
pub fn implied_channels(event: &PatchEvent) -> Vec<String> {
    vec![
        PATCH_EVENTS_CHANNEL.to_string(),
        format!("patch:{}", event.patch_id),
        format!("event:{}", event.event_type.as_str()),
    ]
}

/// `broadcast` 대상 필터 (모두 비어 있으면 전체)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastFilter {
    pub channel: Option<String>,
    pub exclude_connection_id: Option<String>,
    pub target_user_id: Option<String>,
}

impl BroadcastFilter {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    pub fn excluding(mut self, connection_id: impl Into<String>) -> Self {
        self.exclude_connection_id = Some(connection_id.into());
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.target_user_id = Some(user_id.into());
        self
    }

    fn matches(&self, conn: &Connection) -> bool {
        if self.exclude_connection_id.as_deref() == Some(conn.id.as_str()) {
            return false;
        }
        if let Some(channel) = &self.channel {
            if !conn.is_subscribed(channel) {
                return false;
            }
        }
        if let Some(user_id) = &self.target_user_id {
            if conn.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Entry {
    state: Connection,
    outbound: mpsc::Sender<Outbound>,
    reader: Option<AbortHandle>,
}

/// 연결 레지스트리
///
/// 서비스 시작 시 만들고 종료 시 `shutdown()`을 호출합니다.
pub struct ConnectionHub {
    connections: RwLock<HashMap<String, Entry>>,
    verifier: Arc<dyn TokenVerifier>,
    outbound_buffer: usize,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionHub {
    pub fn new(verifier: Arc<dyn TokenVerifier>, outbound_buffer: usize) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            connections: RwLock::new(HashMap::new()),
            verifier,
            outbound_buffer: outbound_buffer.max(1),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn outbound_buffer(&self) -> usize {
        self.outbound_buffer
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 연결 상태 스냅샷
    pub async fn connection(&self, connection_id: &str) -> Option<Connection> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.state.clone())
    }

    /// 이미 만들어진 송신 큐로 연결 등록 (환영 메시지 전송)
    pub async fn attach(
        &self,
        outbound: mpsc::Sender<Outbound>,
        context: Map<String, Value>,
    ) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PatchError::Connection("hub is shut down".to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let welcome = Outbound::Message(Envelope::connected(&id));
        if outbound.try_send(welcome).is_err() {
            return Err(PatchError::Connection(format!(
                "connection {} closed before registration",
                id
            )));
        }

        let mut connections = self.connections.write().await;
        // shutdown은 같은 락 아래에서 레지스트리를 비움
        if self.closed.load(Ordering::SeqCst) {
            return Err(PatchError::Connection("hub is shut down".to_string()));
        }
        connections.insert(
            id.clone(),
            Entry {
                state: Connection::new(id.clone(), context),
                outbound,
                reader: None,
            },
        );
        drop(connections);

        tracing::info!(connection_id = %id, "connection registered");
        Ok(id)
    }

    /// 전송 계층을 등록하고 reader / writer 태스크를 띄움
    pub async fn register<R, W>(
        self: &Arc<Self>,
        reader: R,
        writer: W,
        context: Map<String, Value>,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);

        let id = self.attach(tx, context).await?;

        let hub = Arc::clone(self);
        let writer_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(writer, rx).await {
                tracing::debug!(connection_id = %writer_id, error = %e, "connection writer stopped");
            }
            hub.remove(&writer_id, None).await;
        });

        let hub = Arc::clone(self);
        let reader_id = id.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        hub.handle_message(&reader_id, &line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(connection_id = %reader_id, error = %e, "connection read failed");
                        break;
                    }
                }
            }
            hub.remove(&reader_id, None).await;
        });

        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.reader = Some(reader_task.abort_handle());
        }

        Ok(id)
    }

    /// 수신 메시지 한 건 처리 (잘못된 메시지에는 에러 응답)
    pub async fn handle_message(&self, connection_id: &str, line: &str) {
        let reply = match protocol::parse_inbound(line) {
            Ok(request) => self.dispatch(connection_id, request).await,
            Err(rejection) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    error = %PatchError::from(&rejection),
                    "rejected inbound message"
                );
                self.touch(connection_id).await;
                Some(rejection.into_reply())
            }
        };

        if let Some(reply) = reply {
            self.send_message(connection_id, reply).await;
        }
    }

    async fn dispatch(&self, connection_id: &str, request: Request) -> Option<Envelope> {
        let Request { id, message } = request;

        let transition = match message {
            Inbound::Auth { token } => match self.verifier.verify(&token).await {
                Some(user_id) => Transition::Authenticated { user_id },
                None => {
                    self.touch(connection_id).await;
                    tracing::warn!(connection_id = %connection_id, "authentication failed");
                    return Some(Envelope::error(
                        Some(id),
                        protocol::codes::AUTH_FAILED,
                        "invalid token",
                    ));
                }
            },
            Inbound::Subscribe { channels } => Transition::Subscribe(channels),
            Inbound::Unsubscribe { channels } => Transition::Unsubscribe(channels),
            Inbound::Data { payload } => Transition::Data(payload),
        };

        let mut connections = self.connections.write().await;
        let Some(entry) = connections.get_mut(connection_id) else {
            tracing::debug!(connection_id = %connection_id, "message for unknown connection");
            return None;
        };

        entry.state.touch(Instant::now());
        let payload = entry.state.apply(transition);
        Some(Envelope::reply(id, payload))
    }

    async fn touch(&self, connection_id: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(connection_id) {
            entry.state.touch(Instant::now());
        }
    }

    /// 이벤트를 암시 채널 구독자에게 한 번씩 전달
    pub async fn broadcast_event(&self, event: &PatchEvent) -> usize {
        let channels = implied_channels(event);
        let message = Envelope::event(json!({
            "event": "patch",
            "data": event,
        }));

        let targets = self
            .snapshot(|conn| conn.is_subscribed_any(&channels))
            .await;
        self.deliver(targets, &message).await
    }

    /// 필터에 맞는 연결에 전달, 전달 수 반환
    pub async fn broadcast(&self, message: Envelope, filter: BroadcastFilter) -> usize {
        let targets = self.snapshot(|conn| filter.matches(conn)).await;
        self.deliver(targets, &message).await
    }

    /// 특정 연결에 전달 (없는 연결이면 로그만 남김)
    pub async fn send_message(&self, connection_id: &str, message: Envelope) -> bool {
        let sender = self
            .connections
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.outbound.clone());

        let Some(sender) = sender else {
            tracing::debug!(connection_id = %connection_id, "send to unknown connection dropped");
            return false;
        };

        self.deliver(vec![(connection_id.to_string(), sender)], &message)
            .await
            == 1
    }

    async fn snapshot<F>(&self, predicate: F) -> Vec<(String, mpsc::Sender<Outbound>)>
    where
        F: Fn(&Connection) -> bool,
    {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| predicate(&entry.state))
            .map(|entry| (entry.state.id.clone(), entry.outbound.clone()))
            .collect()
    }

    async fn deliver(&self, targets: Vec<(String, mpsc::Sender<Outbound>)>, message: &Envelope) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, sender) in targets {
            match sender.try_send(Outbound::Message(message.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    let reason = match e {
                        TrySendError::Full(_) => "outbound queue full",
                        TrySendError::Closed(_) => "connection closed",
                    };
                    let error = PatchError::Broadcast {
                        connection_id: id.clone(),
                        reason: reason.to_string(),
                    };
                    tracing::warn!(error = %error, "dropping connection");
                    failed.push(id);
                }
            }
        }

        for id in failed {
            self.remove(&id, None).await;
        }

        delivered
    }

    /// 연결 제거 (`close`가 있으면 종료 알림을 먼저 큐에 넣음)
    async fn remove(&self, connection_id: &str, close: Option<(u16, &str)>) -> bool {
        let Some(entry) = self.connections.write().await.remove(connection_id) else {
            return false;
        };

        if let Some((code, reason)) = close {
            let _ = entry.outbound.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        if let Some(reader) = entry.reader {
            reader.abort();
        }

        tracing::info!(connection_id = %connection_id, "connection removed");
        true
    }

    /// 일정 시간 이상 조용한 연결 정리, 제거된 ID 반환
    pub async fn sweep_inactive(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .connections
            .read()
            .await
            .values()
            .filter(|entry| entry.state.idle_for(now) > timeout)
            .map(|entry| entry.state.id.clone())
            .collect();

        for id in &stale {
            tracing::info!(connection_id = %id, "heartbeat timeout");
            self.remove(id, Some((CLOSE_GOING_AWAY, "heartbeat timeout"))).await;
        }

        stale
    }

    /// shutdown까지 주기적으로 sweep
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = hub.sweep_inactive(timeout).await;
                        if !removed.is_empty() {
                            tracing::debug!(removed = removed.len(), "heartbeat sweep");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// 모든 연결을 정상 종료 코드로 닫고 레지스트리 비움
    pub async fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let _ = self.shutdown_tx.send(());

        let drained: Vec<Entry> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in &drained {
            let _ = entry.outbound.try_send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "server shutdown".to_string(),
            });
            if let Some(reader) = &entry.reader {
                reader.abort();
            }
        }

        tracing::info!(closed = drained.len(), "connection hub shut down");
        drained.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(Arc::new(StaticTokenVerifier::default()), 256)
    }
}

#[async_trait]
impl EventBroadcast for ConnectionHub {
    async fn broadcast_event(&self, event: &PatchEvent) -> usize {
        ConnectionHub::broadcast_event(self, event).await
    }
}

/// 송신 큐를 전송 계층으로 비움 (FIFO)
async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(envelope) => write_line(&mut writer, &envelope).await?,
            Outbound::Close { code, reason } => {
                write_line(&mut writer, &Envelope::close_notice(code, &reason)).await?;
                break;
            }
        }
    }

    writer.shutdown().await?;
    Ok(())
}

async fn write_line<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = envelope.to_json()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    async fn attached(hub: &ConnectionHub, buffer: usize) -> (String, mpsc::Receiver<Outbound>) {
        let (tx, mut rx) = mpsc::channel(buffer);
        let id = hub.attach(tx, Map::new()).await.unwrap();
        // 환영 메시지
        match rx.recv().await {
            Some(Outbound::Message(env)) => assert_eq!(env.payload["event"], "connected"),
            other => panic!("expected welcome, got {:?}", other),
        }
        (id, rx)
    }

    fn reply_payload(outbound: Option<Outbound>) -> Value {
        match outbound {
            Some(Outbound::Message(env)) => env.payload,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_reply() {
        let hub = ConnectionHub::default();
        let (id, mut rx) = attached(&hub, 8).await;

        hub.handle_message(&id, r#"{"id":"r1","type":"subscribe","payload":{"channel":"x"}}"#)
            .await;

        let payload = reply_payload(rx.recv().await);
        assert_eq!(payload["status"], "subscribed");
        assert_eq!(payload["channels"], json!(["x"]));
        assert!(hub.connection(&id).await.unwrap().is_subscribed("x"));
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let hub = ConnectionHub::default();
        let (id, mut rx) = attached(&hub, 8).await;

        hub.handle_message(&id, "{{{").await;

        let payload = reply_payload(rx.recv().await);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["code"], "invalid_json");
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_auth() {
        let verifier = StaticTokenVerifier::default().with_token("t0k", "alice");
        let hub = ConnectionHub::new(Arc::new(verifier), 8);
        let (id, mut rx) = attached(&hub, 8).await;

        hub.handle_message(&id, r#"{"id":"a","type":"auth","payload":{"token":"nope"}}"#)
            .await;
        assert_eq!(reply_payload(rx.recv().await)["code"], "auth_failed");
        assert!(!hub.connection(&id).await.unwrap().authenticated);

        hub.handle_message(&id, r#"{"id":"b","type":"auth","payload":{"token":"t0k"}}"#)
            .await;
        assert_eq!(reply_payload(rx.recv().await)["userId"], "alice");

        let conn = hub.connection(&id).await.unwrap();
        assert!(conn.authenticated);
        assert_eq!(conn.user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_broadcast_filters() {
        let verifier = StaticTokenVerifier::default().with_token("t", "bob");
        let hub = ConnectionHub::new(Arc::new(verifier), 8);
        let (a, mut rx_a) = attached(&hub, 8).await;
        let (b, mut rx_b) = attached(&hub, 8).await;

        hub.handle_message(&b, r#"{"id":"1","type":"auth","payload":{"token":"t"}}"#)
            .await;
        rx_b.recv().await;

        let delivered = hub
            .broadcast(Envelope::event(json!({"n": 1})), BroadcastFilter::default().for_user("bob"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(reply_payload(rx_b.recv().await)["n"], 1);

        let delivered = hub
            .broadcast(Envelope::event(json!({"n": 2})), BroadcastFilter::default().excluding(&a))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(reply_payload(rx_b.recv().await)["n"], 2);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_delivered_once_across_channels() {
        let hub = ConnectionHub::default();
        let (id, mut rx) = attached(&hub, 8).await;

        hub.handle_message(
            &id,
            r#"{"id":"1","type":"subscribe","payload":{"channels":["patch-events","patch:p1"]}}"#,
        )
        .await;
        rx.recv().await;

        let event = PatchEvent::new("p1", EventType::PatchProcessingStarted, Map::new());
        assert_eq!(hub.broadcast_event(&event).await, 1);

        let payload = reply_payload(rx.recv().await);
        assert_eq!(payload["data"]["patchId"], "p1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_removes_only_that_connection() {
        let hub = ConnectionHub::default();
        let (slow, _rx_slow) = attached(&hub, 1).await;
        let (fast, mut rx_fast) = attached(&hub, 8).await;

        for id in [&slow, &fast] {
            let line = r#"{"id":"s","type":"subscribe","payload":{"channel":"x"}}"#;
            hub.handle_message(id, line).await;
        }
        // slow 큐는 구독 응답으로 가득 참
        rx_fast.recv().await;

        let delivered = hub
            .broadcast(Envelope::event(json!({})), BroadcastFilter::channel("x"))
            .await;

        assert_eq!(delivered, 1);
        assert!(hub.connection(&slow).await.is_none());
        assert!(hub.connection(&fast).await.is_some());
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection() {
        let hub = ConnectionHub::default();
        assert!(!hub.send_message("ghost", Envelope::event(json!({}))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_inactive() {
        let hub = ConnectionHub::default();
        let (idle, mut rx_idle) = attached(&hub, 8).await;
        let (busy, _rx_busy) = attached(&hub, 8).await;

        tokio::time::advance(Duration::from_secs(60)).await;
        hub.handle_message(&busy, r#"{"id":"1","type":"data"}"#).await;
        tokio::time::advance(Duration::from_secs(40)).await;

        let removed = hub.sweep_inactive(Duration::from_secs(90)).await;
        assert_eq!(removed, vec![idle.clone()]);
        assert_eq!(hub.connection_count().await, 1);

        match rx_idle.recv().await {
            Some(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_GOING_AWAY),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown() {
        let hub = ConnectionHub::default();
        let (_a, mut rx_a) = attached(&hub, 8).await;
        let (_b, mut rx_b) = attached(&hub, 8).await;

        assert_eq!(hub.shutdown().await, 2);
        assert_eq!(hub.connection_count().await, 0);

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await {
                Some(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_NORMAL),
                other => panic!("expected close, got {:?}", other),
            }
            // 레지스트리가 sender를 버렸으므로 큐가 닫힘
            assert!(rx.recv().await.is_none());
        }

        let (tx, _rx) = mpsc::channel(1);
        assert!(hub.attach(tx, Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_attach_racing_shutdown_is_refused() {
        let hub = Arc::new(ConnectionHub::default());

        // attach가 첫 closed 검사를 통과한 뒤 락에서 기다리게 함
        let guard = hub.connections.write().await;
        let (tx, _rx) = mpsc::channel(4);
        let pending = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.attach(tx, Map::new()).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());

        hub.closed.store(true, Ordering::SeqCst);
        drop(guard);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(PatchError::Connection(_))));
        assert_eq!(hub.connection_count().await, 0);
    }
}
