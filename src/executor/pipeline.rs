use crate::config::Config;
use crate::error::{PatchError, Result};
use crate::events::{EventEmitter, EventType};
use crate::executor::batch::{ExecutionResult, ExecutionStatus, OperationExecutor};
use crate::executor::remediation::{ActionType, Priority, RemediationAction, RemediationPlanner};
use crate::executor::runner::{ApplyMechanism, RequestBuilder};
use crate::executor::validator::{BatchValidator, TaskManifest, ValidationFinding, ValidationReport};
use crate::patch::PatchBatch;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// 배치 처리 상태
///
/// `Created → Validating → (Invalid → Failed) | (Valid → Executing) → Completed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Created,
    Validating,
    Invalid,
    Valid,
    Executing,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Created, Failed)
                | (Validating, Invalid)
                | (Validating, Valid)
                | (Invalid, Failed)
                | (Valid, Executing)
                | (Valid, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

/// 처리 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub success: bool,
    pub patch_id: String,
    pub state: PipelineState,
    pub validation_findings: Vec<ValidationFinding>,
    pub execution_results: Vec<ExecutionResult>,
    pub remediation_actions: Vec<RemediationAction>,
    pub metadata: Map<String, Value>,
}

impl ProcessingResult {
    fn failure(patch_id: &str, action: RemediationAction, metadata: Map<String, Value>) -> Self {
        Self {
            success: false,
            patch_id: patch_id.to_string(),
            state: PipelineState::Failed,
            validation_findings: Vec::new(),
            execution_results: Vec::new(),
            remediation_actions: vec![action],
            metadata,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.execution_results.iter().filter(|r| r.is_error()).count()
    }
}

/// 현재 진행 중인 배치 ID 집합에서 자동으로 빠지는 가드
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.id);
        }
    }
}

struct StateTracker<'a> {
    patch_id: &'a str,
    state: PipelineState,
}

impl<'a> StateTracker<'a> {
    fn new(patch_id: &'a str) -> Self {
        Self {
            patch_id,
            state: PipelineState::Created,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                patch_id = %self.patch_id,
                from = ?self.state,
                to = ?next,
                "unexpected pipeline transition"
            );
        }
        tracing::debug!(patch_id = %self.patch_id, from = ?self.state, to = ?next, "pipeline transition");
        self.state = next;
    }
}

/// 정규화된 배치를 검증 → 실행 → 복구 계획까지 처리
///
/// 서로 다른 배치는 동시에 처리할 수 있습니다. 공유하는 것은 이벤트 로그와
/// 브로드캐스트뿐입니다.
pub struct PatchProcessor {
    validator: BatchValidator,
    executor: OperationExecutor,
    planner: RemediationPlanner,
    events: EventEmitter,
    in_flight: Mutex<HashSet<String>>,
}

impl PatchProcessor {
    pub fn new(
        validator: BatchValidator,
        executor: OperationExecutor,
        planner: RemediationPlanner,
        events: EventEmitter,
    ) -> Self {
        Self {
            validator,
            executor,
            planner,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// 설정에서 모든 구성 요소를 만듦
    pub fn from_config(
        config: &Config,
        mechanism: Arc<dyn ApplyMechanism>,
        events: EventEmitter,
    ) -> Result<Self> {
        let mut validator = BatchValidator::from_config(config)?;
        if config.task_manifest {
            if let Some(manifest) = TaskManifest::discover(&config.working_directory()?)? {
                validator = validator.with_task_manifest(manifest);
            }
        }

        let executor = OperationExecutor::new(
            mechanism,
            RequestBuilder::from_config(config)?,
            events.clone(),
        );

        Ok(Self::new(
            validator,
            executor,
            RemediationPlanner::from_config(config)?,
            events,
        ))
    }

    pub fn validator(&self) -> &BatchValidator {
        &self.validator
    }

    /// 배치 하나를 끝까지 처리
    ///
    /// 어떤 경우에도 에러를 던지지 않고 구조화된 결과를 반환합니다.
    pub async fn process_patch_batch(&self, batch: &PatchBatch) -> ProcessingResult {
        let patch_id = batch.id();

        let _guard = match self.claim(patch_id) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(patch_id = %patch_id, error = %e, "refusing duplicate batch");
                let mut metadata = Map::new();
                metadata.insert("error".to_string(), json!(e.to_string()));
                return ProcessingResult::failure(
                    patch_id,
                    RemediationAction::new(ActionType::ManualReview, Priority::High, e.to_string()),
                    metadata,
                );
            }
        };

        let mut tracker = StateTracker::new(patch_id);
        tracker.advance(PipelineState::Validating);

        let report = self.validator.validate(batch);
        if !report.valid {
            tracker.advance(PipelineState::Invalid);
            let result = self.reject(batch, &report).await;
            tracker.advance(PipelineState::Failed);
            return result;
        }
        tracker.advance(PipelineState::Valid);

        let outcome = AssertUnwindSafe(self.run(batch, &report, &mut tracker))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => self.critical(patch_id, e.to_string()).await,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.critical(patch_id, message).await
            }
        }
    }

    fn claim(&self, patch_id: &str) -> Result<InFlightGuard<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| PatchError::CriticalProcessing("in-flight registry poisoned".to_string()))?;

        if !set.insert(patch_id.to_string()) {
            return Err(PatchError::DuplicateBatch(patch_id.to_string()));
        }

        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            id: patch_id.to_string(),
        })
    }

    /// 검증 실패: 아무 작업도 실행하지 않음
    async fn reject(&self, batch: &PatchBatch, report: &ValidationReport) -> ProcessingResult {
        let patch_id = batch.id();
        let error = PatchError::Validation {
            errors: report.errors.len(),
        };

        tracing::warn!(
            patch_id = %patch_id,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "patch batch failed validation"
        );

        let mut metadata = Map::new();
        metadata.insert("errorCount".to_string(), json!(report.errors.len()));
        metadata.insert("warningCount".to_string(), json!(report.warnings.len()));
        metadata.insert("errors".to_string(), json!(report.errors));

        self.events
            .emit(patch_id, EventType::PatchValidationFailed, metadata.clone())
            .await;

        ProcessingResult {
            success: false,
            patch_id: patch_id.to_string(),
            state: PipelineState::Failed,
            validation_findings: report.findings(),
            execution_results: Vec::new(),
            remediation_actions: vec![RemediationAction::new(
                ActionType::ManualReview,
                Priority::High,
                format!("{}; fix the reported findings and resubmit", error),
            )],
            metadata,
        }
    }

    async fn run(
        &self,
        batch: &PatchBatch,
        report: &ValidationReport,
        tracker: &mut StateTracker<'_>,
    ) -> Result<ProcessingResult> {
        let patch_id = batch.id();
        let start_time = Instant::now();

        let mut started = Map::new();
        started.insert("operationCount".to_string(), json!(batch.len()));
        started.insert("warningCount".to_string(), json!(report.warnings.len()));
        self.events
            .emit(patch_id, EventType::PatchProcessingStarted, started)
            .await;

        tracker.advance(PipelineState::Executing);
        let results = self.executor.execute(patch_id, batch.operations()).await;

        if results.len() != batch.len() {
            return Err(PatchError::CriticalProcessing(format!(
                "executor returned {} results for {} operations",
                results.len(),
                batch.len()
            )));
        }

        let success = results.iter().all(|r| r.status != ExecutionStatus::Error);
        let remediation_actions = if success {
            Vec::new()
        } else {
            self.planner.plan(&results)
        };

        let count = |status: ExecutionStatus| results.iter().filter(|r| r.status == status).count();
        let mut metadata = Map::new();
        metadata.insert("operationCount".to_string(), json!(batch.len()));
        metadata.insert("succeeded".to_string(), json!(count(ExecutionStatus::Success)));
        metadata.insert("failed".to_string(), json!(count(ExecutionStatus::Error)));
        metadata.insert("skipped".to_string(), json!(count(ExecutionStatus::Skipped)));
        metadata.insert(
            "totalTimeMs".to_string(),
            json!(start_time.elapsed().as_millis() as u64),
        );

        let (event_type, state) = if success {
            (EventType::PatchProcessingCompleted, PipelineState::Completed)
        } else {
            (EventType::PatchProcessingFailed, PipelineState::Failed)
        };
        self.events.emit(patch_id, event_type, metadata.clone()).await;
        tracker.advance(state);

        tracing::info!(
            patch_id = %patch_id,
            success,
            failed = count(ExecutionStatus::Error),
            total = batch.len(),
            "patch batch processed"
        );

        Ok(ProcessingResult {
            success,
            patch_id: patch_id.to_string(),
            state,
            validation_findings: report.findings(),
            execution_results: results,
            remediation_actions,
            metadata,
        })
    }

    async fn critical(&self, patch_id: &str, message: String) -> ProcessingResult {
        tracing::error!(patch_id = %patch_id, error = %message, "critical patch processing error");

        let mut metadata = Map::new();
        metadata.insert("error".to_string(), json!(message));

        self.events
            .emit(patch_id, EventType::PatchProcessingCriticalError, metadata.clone())
            .await;

        ProcessingResult::failure(
            patch_id,
            RemediationAction::new(
                ActionType::ManualReview,
                Priority::Critical,
                format!("Processing aborted unexpectedly: {}", message),
            ),
            metadata,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::executor::runner::{ApplyOutcome, ApplyRequest};
    use crate::patch::{OpKind, Operation};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;

    struct AlwaysOk;

    #[async_trait]
    impl ApplyMechanism for AlwaysOk {
        async fn apply(&self, _request: ApplyRequest) -> Result<ApplyOutcome> {
            Ok(ApplyOutcome::success(None, 1))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ApplyMechanism for Panicking {
        async fn apply(&self, _request: ApplyRequest) -> Result<ApplyOutcome> {
            panic!("apply tool exploded");
        }
    }

    struct Slow;

    #[async_trait]
    impl ApplyMechanism for Slow {
        async fn apply(&self, _request: ApplyRequest) -> Result<ApplyOutcome> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(ApplyOutcome::success(None, 300))
        }
    }

    fn processor(mechanism: Arc<dyn ApplyMechanism>, log: Arc<MemoryEventLog>) -> PatchProcessor {
        let events = EventEmitter::new(log);
        PatchProcessor::new(
            BatchValidator::default(),
            OperationExecutor::new(
                mechanism,
                RequestBuilder::new("patch-manager", PathBuf::from(".")).with_timeout_ms(5_000),
                events.clone(),
            ),
            RemediationPlanner::default(),
            events,
        )
    }

    fn batch(id: &str, ops: Vec<Operation>) -> PatchBatch {
        PatchBatch::new(id, ops, Map::new()).unwrap()
    }

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Created.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Invalid));
        assert!(Invalid.can_transition_to(Failed));
        assert!(Executing.can_transition_to(Completed));
        assert!(!Invalid.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Executing));
        assert!(Completed.is_terminal());
        assert!(!Valid.is_terminal());
    }

    #[tokio::test]
    async fn test_successful_batch_events() {
        let log = Arc::new(MemoryEventLog::new());
        let processor = processor(Arc::new(AlwaysOk), log.clone());

        let result = processor
            .process_patch_batch(&batch("p1", vec![Operation::new(OpKind::Replace, "a.ts").with_value("x")]))
            .await;

        assert!(result.success);
        assert_eq!(result.state, PipelineState::Completed);
        assert_eq!(result.metadata["succeeded"], 1);
        assert_eq!(
            log.event_types(),
            vec![
                EventType::PatchProcessingStarted,
                EventType::ExecutionOperationSucceeded,
                EventType::PatchProcessingCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_batch_never_executes() {
        let log = Arc::new(MemoryEventLog::new());
        let processor = processor(Arc::new(AlwaysOk), log.clone());

        let result = processor
            .process_patch_batch(&batch(
                "p2",
                vec![
                    Operation::new(OpKind::Replace, "a.ts").with_value("x"),
                    Operation::new(OpKind::Add, "/etc/hosts").with_value("x"),
                ],
            ))
            .await;

        assert!(!result.success);
        assert_eq!(result.state, PipelineState::Failed);
        assert!(result.execution_results.is_empty());
        assert_eq!(result.remediation_actions.len(), 1);
        assert_eq!(result.remediation_actions[0].action_type, ActionType::ManualReview);
        assert_eq!(result.remediation_actions[0].priority, Priority::High);
        assert_eq!(log.event_types(), vec![EventType::PatchValidationFailed]);
    }

    #[tokio::test]
    async fn test_panic_becomes_critical_result() {
        let log = Arc::new(MemoryEventLog::new());
        let processor = processor(Arc::new(Panicking), log.clone());

        let result = processor
            .process_patch_batch(&batch("p3", vec![Operation::new(OpKind::Remove, "a.ts")]))
            .await;

        assert!(!result.success);
        assert_eq!(result.remediation_actions.len(), 1);
        assert_eq!(result.remediation_actions[0].action_type, ActionType::ManualReview);
        assert_eq!(result.remediation_actions[0].priority, Priority::Critical);
        assert!(result.metadata["error"].as_str().unwrap().contains("apply tool exploded"));
        assert_eq!(
            log.event_types().last(),
            Some(&EventType::PatchProcessingCriticalError)
        );

        // 가드가 해제되어 같은 ID로 다시 처리 가능
        let again = processor
            .process_patch_batch(&batch("p3", vec![Operation::new(OpKind::Remove, "a.ts")]))
            .await;
        assert!(again.metadata["error"].as_str().unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_batch_refused() {
        let log = Arc::new(MemoryEventLog::new());
        let processor = Arc::new(processor(Arc::new(Slow), log));
        let b = batch("dup", vec![Operation::new(OpKind::Remove, "a.ts")]);

        let first = {
            let processor = processor.clone();
            let b = b.clone();
            tokio::spawn(async move { processor.process_patch_batch(&b).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = processor.process_patch_batch(&b).await;
        assert!(!second.success);
        assert!(second.execution_results.is_empty());
        assert!(second.metadata["error"].as_str().unwrap().contains("already being processed"));

        let first = first.await.unwrap();
        assert!(first.success);
    }

    #[tokio::test]
    async fn test_concurrent_distinct_batches() {
        let log = Arc::new(MemoryEventLog::new());
        let processor = Arc::new(processor(Arc::new(Slow), log));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let processor = processor.clone();
                tokio::spawn(async move {
                    let b = batch(&format!("b{}", i), vec![Operation::new(OpKind::Remove, "a.ts")]);
                    processor.process_patch_batch(&b).await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
    }
}
