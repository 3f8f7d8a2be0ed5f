use crate::commands::load_batch;
use crate::ui::{self, create_spinner};
use patchflow::config::Config;
use patchflow::error::Result;
use patchflow::events::{EventEmitter, JsonlEventLog};
use patchflow::executor::{BatchValidator, CommandRunner, PatchProcessor, TaskManifest};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ProcessOptions {
    pub dry_run: bool,
    pub working_dir: Option<PathBuf>,
    pub event_log: Option<PathBuf>,
}

/// 파일 하나를 전체 파이프라인으로 처리, 결과 JSON은 stdout
pub async fn process_file(mut config: Config, path: &Path, options: ProcessOptions) -> Result<bool> {
    if options.dry_run {
        config.dry_run = true;
    }
    if options.working_dir.is_some() {
        config.working_directory = options.working_dir;
    }
    if options.event_log.is_some() {
        config.event_log_path = options.event_log;
    }

    let batch = load_batch(path)?;
    let events = EventEmitter::new(Arc::new(JsonlEventLog::new(config.event_log_path()?)));
    let processor = PatchProcessor::from_config(&config, Arc::new(CommandRunner::new()), events)?;

    let spinner = create_spinner(&format!(
        "Processing {} ({} operation(s))...",
        batch.id(),
        batch.len()
    ));
    let result = processor.process_patch_batch(&batch).await;
    if result.success {
        ui::finish_spinner(&spinner, "done");
    } else {
        ui::fail_spinner(&spinner, "failed");
    }

    ui::print_processing_result(&result);
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(result.success)
}

/// 검증 결과 JSON은 stdout
pub fn validate_file(config: &Config, path: &Path) -> Result<bool> {
    let batch = load_batch(path)?;

    let mut validator = BatchValidator::from_config(config)?;
    if config.task_manifest {
        if let Some(manifest) = TaskManifest::discover(&config.working_directory()?)? {
            validator = validator.with_task_manifest(manifest);
        }
    }

    let report = validator.validate(&batch);
    ui::print_validation_report(batch.id(), &report);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(report.valid)
}

pub fn normalize_file(path: &Path) -> Result<()> {
    let batch = load_batch(path)?;
    println!("{}", serde_json::to_string_pretty(&batch)?);
    Ok(())
}
