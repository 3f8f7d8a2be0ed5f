pub mod files;
pub mod normalizer;

use crate::error::{PatchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use normalizer::{group_operations, merge_batches, normalize};

/// 정규화된 작업 종류 (JSON-Patch 어휘)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Remove => "remove",
            OpKind::Replace => "replace",
            OpKind::Move => "move",
            OpKind::Copy => "copy",
            OpKind::Test => "test",
        }
    }

    /// value가 필요한 작업인지
    pub fn requires_value(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Replace | OpKind::Test)
    }

    /// from이 필요한 작업인지
    pub fn requires_from(&self) -> bool {
        matches!(self, OpKind::Move | OpKind::Copy)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 내용을 파일 끝에 붙일지, 대체할지
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Append,
    Replace,
}

/// 파일 단위 작업 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub op: OpKind,
    /// 상대 경로
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// 파일 전체 대신 수정할 영역 마커
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Operation {
    pub fn new(op: OpKind, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            from: None,
            value: None,
            block: None,
            position: None,
            task_id: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_block(mut self, block: impl Into<String>) -> Self {
        self.block = Some(block.into());
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// 와이어 포맷: `{ patchId, operations, metadata? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBatch {
    pub patch_id: String,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// 한 번에 처리되는 작업 묶음
///
/// 생성 후에는 변경되지 않으며, 작업 순서가 곧 실행 순서입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireBatch", into = "WireBatch")]
pub struct PatchBatch {
    id: String,
    operations: Vec<Operation>,
    metadata: Map<String, Value>,
}

impl PatchBatch {
    pub fn new(
        id: impl Into<String>,
        operations: Vec<Operation>,
        metadata: Map<String, Value>,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PatchError::MalformedInput(
                "batch id must not be empty".to_string(),
            ));
        }
        if operations.is_empty() {
            return Err(PatchError::MalformedInput(format!(
                "batch '{}' has no operations",
                id
            )));
        }

        Ok(Self {
            id,
            operations,
            metadata,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// 항상 false (빈 배치는 만들 수 없음)
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// 와이어 JSON에서 파싱
    pub fn from_json(json: &str) -> Result<Self> {
        let wire: WireBatch = serde_json::from_str(json)?;
        Self::try_from(wire)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl TryFrom<WireBatch> for PatchBatch {
    type Error = PatchError;

    fn try_from(wire: WireBatch) -> Result<Self> {
        PatchBatch::new(wire.patch_id, wire.operations, wire.metadata)
    }
}

impl From<PatchBatch> for WireBatch {
    fn from(batch: PatchBatch) -> Self {
        WireBatch {
            patch_id: batch.id,
            operations: batch.operations,
            metadata: batch.metadata,
        }
    }
}
