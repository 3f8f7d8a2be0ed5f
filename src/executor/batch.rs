use crate::events::{EventEmitter, EventType};
use crate::executor::runner::{ApplyMechanism, ApplyOutcome, RequestBuilder};
use crate::error::PatchError;
use crate::patch::Operation;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    Error,
    Skipped,
}

/// 작업 하나의 실행 결과 (배치와 같은 인덱스 공간)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub operation_index: usize,
    pub file_path: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn success(index: usize, op: &Operation, execution_time_ms: u64) -> Self {
        Self {
            operation_index: index,
            file_path: op.path.clone(),
            status: ExecutionStatus::Success,
            message: None,
            execution_time_ms,
        }
    }

    pub fn skipped(index: usize, op: &Operation, execution_time_ms: u64) -> Self {
        Self {
            operation_index: index,
            file_path: op.path.clone(),
            status: ExecutionStatus::Skipped,
            message: Some("already in requested state".to_string()),
            execution_time_ms,
        }
    }

    pub fn failure(index: usize, op: &Operation, message: String, execution_time_ms: u64) -> Self {
        Self {
            operation_index: index,
            file_path: op.path.clone(),
            status: ExecutionStatus::Error,
            message: Some(message),
            execution_time_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ExecutionStatus::Error
    }

    /// 실패한 결과를 에러 값으로
    pub fn to_error(&self) -> Option<PatchError> {
        self.is_error().then(|| PatchError::OperationExecution {
            index: self.operation_index,
            message: self.message.clone().unwrap_or_default(),
        })
    }
}

/// 작업 실행기
///
/// 작업은 배열 순서대로 하나씩 실행됩니다. 뒤의 작업이 앞 작업이 남긴
/// 파일 상태에 의존할 수 있으므로 병렬로 돌리지 않습니다.
/// 한 작업의 실패는 그 작업의 결과에만 기록되고 다음 작업은 계속 실행됩니다.
#[derive(Clone)]
pub struct OperationExecutor {
    mechanism: Arc<dyn ApplyMechanism>,
    requests: RequestBuilder,
    events: EventEmitter,
}

impl OperationExecutor {
    pub fn new(mechanism: Arc<dyn ApplyMechanism>, requests: RequestBuilder, events: EventEmitter) -> Self {
        Self {
            mechanism,
            requests,
            events,
        }
    }

    pub async fn execute(&self, batch_id: &str, operations: &[Operation]) -> Vec<ExecutionResult> {
        let total = operations.len();
        let mut results = Vec::with_capacity(total);

        tracing::info!(patch_id = %batch_id, operations = total, "executing operations");

        for (index, op) in operations.iter().enumerate() {
            tracing::debug!(
                patch_id = %batch_id,
                index,
                total,
                op = op.op.as_str(),
                path = %op.path,
                "applying operation"
            );
            let result = self.execute_operation(batch_id, index, op).await;
            results.push(result);
        }

        results
    }

    /// 단일 작업 실행 (실패는 결과로 변환)
    async fn execute_operation(&self, batch_id: &str, index: usize, op: &Operation) -> ExecutionResult {
        let start_time = Instant::now();

        let attempt = match self.requests.build(batch_id, op) {
            Ok(request) => {
                match tokio::time::timeout(self.requests.timeout(), self.mechanism.apply(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(PatchError::Timeout {
                        ms: self.requests.timeout_ms(),
                    }),
                }
            }
            Err(e) => Err(e),
        };

        let duration = start_time.elapsed().as_millis() as u64;

        let (result, event_type) = match attempt {
            Ok(outcome) if outcome.is_skipped() => {
                (ExecutionResult::skipped(index, op, duration), EventType::ExecutionOperationSucceeded)
            }
            Ok(outcome) if outcome.success => {
                (ExecutionResult::success(index, op, duration), EventType::ExecutionOperationSucceeded)
            }
            Ok(outcome) => (
                ExecutionResult::failure(index, op, failure_message(&outcome), duration),
                EventType::ExecutionOperationFailed,
            ),
            Err(e) => {
                let message = match &e {
                    PatchError::Timeout { ms } => format!("operation timed out after {}ms", ms),
                    other => other.to_string(),
                };
                (
                    ExecutionResult::failure(index, op, message, duration),
                    EventType::ExecutionOperationErrored,
                )
            }
        };

        if let Some(error) = result.to_error() {
            tracing::warn!(
                patch_id = %batch_id,
                path = %op.path,
                error = %error,
                "operation failed"
            );
        }

        self.events
            .emit(batch_id, event_type, operation_metadata(index, op, &result))
            .await;

        result
    }
}

fn failure_message(outcome: &ApplyOutcome) -> String {
    outcome
        .error
        .clone()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| format!("apply mechanism exited with code {}", outcome.exit_code))
}

fn operation_metadata(index: usize, op: &Operation, result: &ExecutionResult) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("operationIndex".to_string(), json!(index));
    metadata.insert("filePath".to_string(), json!(op.path));
    metadata.insert("op".to_string(), json!(op.op.as_str()));
    metadata.insert("executionTimeMs".to_string(), json!(result.execution_time_ms));
    if let Some(message) = &result.message {
        metadata.insert("message".to_string(), json!(message));
    }
    metadata
}
