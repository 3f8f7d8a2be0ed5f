use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tokio::time::{Duration, Instant};

/// 허브가 소유하는 연결 하나의 상태
///
/// 구독 목록은 같은 연결로 들어온 메시지만 바꿉니다.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub subscriptions: BTreeSet<String>,
    pub user_id: Option<String>,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub context: Map<String, Value>,
}

/// 수신 메시지가 연결 상태에 일으키는 변화
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Authenticated { user_id: String },
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Data(Value),
}

impl Connection {
    /// `context`의 `userId`는 인증 전 사용자 힌트로만 저장
    pub fn new(id: impl Into<String>, context: Map<String, Value>) -> Self {
        let user_id = context
            .get("userId")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            id: id.into(),
            subscriptions: BTreeSet::new(),
            user_id,
            authenticated: false,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            context,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn is_subscribed_any(&self, channels: &[String]) -> bool {
        channels.iter().any(|c| self.subscriptions.contains(c))
    }

    /// 상태를 바꾸고 응답 payload를 돌려줌
    pub fn apply(&mut self, transition: Transition) -> Value {
        match transition {
            Transition::Authenticated { user_id } => {
                self.authenticated = true;
                self.user_id = Some(user_id.clone());
                json!({ "status": "authenticated", "userId": user_id })
            }
            Transition::Subscribe(channels) => {
                self.subscriptions.extend(channels);
                json!({ "status": "subscribed", "channels": self.subscriptions })
            }
            Transition::Unsubscribe(channels) => {
                for channel in &channels {
                    self.subscriptions.remove(channel);
                }
                json!({ "status": "unsubscribed", "channels": self.subscriptions })
            }
            Transition::Data(payload) => json!({ "ack": true, "echo": payload }),
        }
    }
}
