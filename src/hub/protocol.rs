use crate::error::PatchError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 정상 종료 (서버 shutdown)
pub const CLOSE_NORMAL: u16 = 1000;
/// 하트비트 타임아웃 등으로 서버가 연결을 정리
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// 에러 응답 코드
pub mod codes {
    pub const INVALID_JSON: &str = "invalid_json";
    pub const INVALID_ENVELOPE: &str = "invalid_envelope";
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    pub const UNSUPPORTED_TYPE: &str = "unsupported_type";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const AUTH_FAILED: &str = "auth_failed";
}

/// 메시지 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Auth,
    Subscribe,
    Unsubscribe,
    Data,
    Event,
}

impl MessageKind {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "auth" => Some(MessageKind::Auth),
            "subscribe" => Some(MessageKind::Subscribe),
            "unsubscribe" => Some(MessageKind::Unsubscribe),
            "data" => Some(MessageKind::Data),
            "event" => Some(MessageKind::Event),
            _ => None,
        }
    }
}

/// 양방향 공통 봉투 (한 줄에 JSON 하나)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(id: impl Into<String>, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
        }
    }

    /// 요청에 대한 응답 (같은 id)
    pub fn reply(request_id: impl Into<String>, payload: Value) -> Self {
        Self::new(request_id, MessageKind::Data, payload)
    }

    /// 서버가 먼저 보내는 이벤트
    pub fn event(payload: Value) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), MessageKind::Event, payload)
    }

    pub fn error(request_id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        let id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::reply(
            id,
            json!({
                "status": "error",
                "code": code,
                "message": message.into(),
            }),
        )
    }

    pub fn connected(connection_id: &str) -> Self {
        Self::event(json!({
            "event": "connected",
            "connectionId": connection_id,
        }))
    }

    pub fn close_notice(code: u16, reason: &str) -> Self {
        Self::event(json!({
            "event": "close",
            "code": code,
            "reason": reason,
        }))
    }

    /// JSON으로 직렬화
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// JSON에서 역직렬화
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 클라이언트가 보낼 수 있는 메시지
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Auth { token: String },
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Data { payload: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub message: Inbound,
}

/// 파싱 실패 (연결은 유지하고 에러 응답만 보냄)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub request_id: Option<String>,
    pub code: &'static str,
    pub message: String,
}

impl Rejection {
    fn new(request_id: Option<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            request_id,
            code,
            message: message.into(),
        }
    }

    pub fn into_reply(self) -> Envelope {
        Envelope::error(self.request_id, self.code, self.message)
    }
}

impl From<&Rejection> for PatchError {
    fn from(rejection: &Rejection) -> Self {
        PatchError::Protocol(format!("{}: {}", rejection.code, rejection.message))
    }
}

/// 수신한 한 줄을 요청으로 변환
pub fn parse_inbound(line: &str) -> Result<Request, Rejection> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| Rejection::new(None, codes::INVALID_JSON, format!("invalid JSON: {}", e)))?;

    let Value::Object(mut object) = value else {
        return Err(Rejection::new(
            None,
            codes::INVALID_ENVELOPE,
            "message must be a JSON object",
        ));
    };

    let id = match object.remove("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id,
        _ => {
            return Err(Rejection::new(
                None,
                codes::INVALID_ENVELOPE,
                "message requires a non-empty string 'id'",
            ))
        }
    };

    let tag = match object.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(Rejection::new(
                Some(id),
                codes::INVALID_ENVELOPE,
                "message requires a string 'type'",
            ))
        }
    };

    let payload = match object.remove("payload") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(payload)) => payload,
        Some(_) => {
            return Err(Rejection::new(
                Some(id),
                codes::INVALID_ENVELOPE,
                "'payload' must be an object",
            ))
        }
    };

    let message = match MessageKind::parse(&tag) {
        Some(MessageKind::Auth) => match payload.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => Inbound::Auth {
                token: token.to_string(),
            },
            _ => {
                return Err(Rejection::new(
                    Some(id),
                    codes::INVALID_PAYLOAD,
                    "auth requires a 'token'",
                ))
            }
        },
        Some(MessageKind::Subscribe) => Inbound::Subscribe {
            channels: channels(&payload).map_err(|m| Rejection::new(Some(id.clone()), codes::INVALID_PAYLOAD, m))?,
        },
        Some(MessageKind::Unsubscribe) => Inbound::Unsubscribe {
            channels: channels(&payload).map_err(|m| Rejection::new(Some(id.clone()), codes::INVALID_PAYLOAD, m))?,
        },
        Some(MessageKind::Data) => Inbound::Data {
            payload: Value::Object(payload),
        },
        Some(MessageKind::Event) => {
            return Err(Rejection::new(
                Some(id),
                codes::UNSUPPORTED_TYPE,
                "clients cannot send 'event' messages",
            ))
        }
        None => {
            return Err(Rejection::new(
                Some(id),
                codes::UNKNOWN_TYPE,
                format!("unknown message type '{}'", tag),
            ))
        }
    };

    Ok(Request { id, message })
}

/// payload의 `channel` 또는 `channels`
fn channels(payload: &Map<String, Value>) -> Result<Vec<String>, String> {
    let mut channels = Vec::new();

    if let Some(channel) = payload.get("channel") {
        match channel.as_str() {
            Some(c) => channels.push(c.to_string()),
            None => return Err("'channel' must be a string".to_string()),
        }
    }

    if let Some(list) = payload.get("channels") {
        let Some(list) = list.as_array() else {
            return Err("'channels' must be an array of strings".to_string());
        };
        for item in list {
            match item.as_str() {
                Some(c) => channels.push(c.to_string()),
                None => return Err("'channels' must be an array of strings".to_string()),
            }
        }
    }

    if channels.is_empty() {
        return Err("a 'channel' or 'channels' field is required".to_string());
    }
    if channels.iter().any(|c| c.trim().is_empty()) {
        return Err("channel names must not be empty".to_string());
    }

    Ok(channels)
}

/// 연결별 송신 큐에 들어가는 항목
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(Envelope),
    /// 종료 알림을 보내고 쓰기 쪽을 닫음
    Close { code: u16, reason: String },
}
