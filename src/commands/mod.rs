pub mod patch;
pub mod serve;

pub use patch::{normalize_file, process_file, validate_file};
pub use serve::serve;

use patchflow::config::Config;
use patchflow::error::{PatchError, Result};
use patchflow::patch::{normalizer, PatchBatch};
use serde_json::Value;
use std::path::Path;

/// `--config`가 있으면 그 파일, 없으면 기본 경로
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// 입력 파일을 배치로 읽음
///
/// `patchId`가 있으면 정규 배치, 아니면 생성기 출력으로 보고 정규화합니다.
pub fn load_batch(path: &Path) -> Result<PatchBatch> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PatchError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read {}: {}", path.display(), e),
        ))
    })?;

    let raw: Value = serde_json::from_str(&content)
        .map_err(|e| PatchError::MalformedInput(format!("{}: {}", path.display(), e)))?;

    if raw.get("patchId").is_some() {
        let batch: PatchBatch = serde_json::from_value(raw)
            .map_err(|e| PatchError::MalformedInput(format!("{}: {}", path.display(), e)))?;
        Ok(batch)
    } else {
        normalizer::normalize(&raw)
    }
}
