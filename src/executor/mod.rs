pub mod runner;
pub mod validator;
pub mod batch;
pub mod remediation;
pub mod pipeline;

// Re-exports for convenience (used in main.rs and commands)
pub use batch::{ExecutionResult, ExecutionStatus, OperationExecutor};
pub use pipeline::{PatchProcessor, PipelineState, ProcessingResult};
pub use remediation::{ActionType, Priority, RemediationAction, RemediationPlanner};
pub use runner::{ApplyMechanism, ApplyOutcome, ApplyRequest, CommandRunner, RequestBuilder};
pub use validator::{BatchValidator, Severity, TaskManifest, ValidationFinding, ValidationReport};
