//! Patch lifecycle events.
//!
//! Every pipeline stage emits a [`PatchEvent`]. The event is first appended
//! to an [`EventLog`] (audit), then handed to an [`EventBroadcast`] for live
//! subscribers. Neither step can fail the pipeline.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    PatchProcessingStarted,
    PatchValidationFailed,
    ExecutionOperationSucceeded,
    ExecutionOperationFailed,
    ExecutionOperationErrored,
    PatchProcessingCompleted,
    PatchProcessingFailed,
    PatchProcessingCriticalError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PatchProcessingStarted => "PatchProcessingStarted",
            EventType::PatchValidationFailed => "PatchValidationFailed",
            EventType::ExecutionOperationSucceeded => "ExecutionOperationSucceeded",
            EventType::ExecutionOperationFailed => "ExecutionOperationFailed",
            EventType::ExecutionOperationErrored => "ExecutionOperationErrored",
            EventType::PatchProcessingCompleted => "PatchProcessingCompleted",
            EventType::PatchProcessingFailed => "PatchProcessingFailed",
            EventType::PatchProcessingCriticalError => "PatchProcessingCriticalError",
        }
    }

    /// 이벤트 종류에서 상태 문자열 도출
    pub fn status(&self) -> &'static str {
        match self {
            EventType::PatchProcessingStarted => "started",
            EventType::PatchValidationFailed => "invalid",
            EventType::ExecutionOperationSucceeded => "succeeded",
            EventType::ExecutionOperationFailed => "failed",
            EventType::ExecutionOperationErrored => "errored",
            EventType::PatchProcessingCompleted => "completed",
            EventType::PatchProcessingFailed => "failed",
            EventType::PatchProcessingCriticalError => "critical",
        }
    }
}

/// 생성 후 변경되지 않는 이벤트 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEvent {
    pub id: String,
    pub patch_id: String,
    pub event_type: EventType,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PatchEvent {
    pub fn new(patch_id: impl Into<String>, event_type: EventType, metadata: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            patch_id: patch_id.into(),
            event_type,
            status: event_type.status().to_string(),
            created_at: Utc::now(),
            metadata,
        }
    }
}

/// 감사용 append-only 이벤트 저장소
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn log_event(&self, event: &PatchEvent) -> Result<()>;
}

/// 실시간 구독자에게 이벤트 전달
#[async_trait]
pub trait EventBroadcast: Send + Sync {
    /// 전달된 연결 수 반환
    async fn broadcast_event(&self, event: &PatchEvent) -> usize;
}

/// 메모리에 쌓아두는 로그 (테스트, 단발성 실행용)
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<PatchEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PatchEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn log_event(&self, event: &PatchEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// 구조화 로그로만 남김
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

#[async_trait]
impl EventLog for TracingEventLog {
    async fn log_event(&self, event: &PatchEvent) -> Result<()> {
        tracing::info!(
            target: "patchflow::events",
            event_id = %event.id,
            patch_id = %event.patch_id,
            event_type = event.event_type.as_str(),
            status = %event.status,
            metadata = %serde_json::Value::Object(event.metadata.clone()),
            "patch event"
        );
        Ok(())
    }
}

/// JSON Lines 파일에 append
pub struct JsonlEventLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn log_event(&self, event: &PatchEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }
}

/// 로그 기록 후 브로드캐스트
///
/// 로그 실패는 경고만 남기고 파이프라인에는 영향을 주지 않습니다.
#[derive(Clone)]
pub struct EventEmitter {
    log: Arc<dyn EventLog>,
    broadcaster: Option<Arc<dyn EventBroadcast>>,
}

impl EventEmitter {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn EventBroadcast>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub async fn emit(
        &self,
        patch_id: &str,
        event_type: EventType,
        metadata: Map<String, Value>,
    ) -> PatchEvent {
        let event = PatchEvent::new(patch_id, event_type, metadata);

        if let Err(e) = self.log.log_event(&event).await {
            tracing::warn!(
                patch_id = %patch_id,
                event_type = event_type.as_str(),
                error = %e,
                "failed to log patch event"
            );
        }

        if let Some(broadcaster) = &self.broadcaster {
            let delivered = broadcaster.broadcast_event(&event).await;
            tracing::debug!(
                patch_id = %patch_id,
                event_type = event_type.as_str(),
                delivered,
                "patch event broadcast"
            );
        }

        event
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("broadcast", &self.broadcaster.is_some())
            .finish()
    }
}
