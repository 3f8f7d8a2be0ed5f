//! Generator output → canonical `PatchBatch`.
//!
//! Upstream generators describe changes with their own vocabulary
//! (`create`, `update`, `delete`, ...). Everything downstream only
//! understands [`OpKind`], so this is the single place that translation
//! happens.

use crate::error::{PatchError, Result};
use crate::patch::{OpKind, Operation, PatchBatch, Position};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// 입력을 만든 생성기 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    Factory,
    Template,
    Agent,
    Orchestrator,
}

impl Producer {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "factory" => Some(Producer::Factory),
            "template" => Some(Producer::Template),
            "agent" => Some(Producer::Agent),
            "orchestrator" => Some(Producer::Orchestrator),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Producer::Factory => "factory",
            Producer::Template => "template",
            Producer::Agent => "agent",
            Producer::Orchestrator => "orchestrator",
        }
    }
}

/// 생성기 쪽 작업 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChangeKind {
    Create,
    Update,
    Delete,
    Move,
    Copy,
}

impl ChangeKind {
    fn canonical(self) -> OpKind {
        match self {
            ChangeKind::Create => OpKind::Add,
            ChangeKind::Update => OpKind::Replace,
            ChangeKind::Delete => OpKind::Remove,
            ChangeKind::Move => OpKind::Move,
            ChangeKind::Copy => OpKind::Copy,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOperation {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FactoryOutput {
    #[serde(default)]
    order_id: Option<String>,
    operations: Vec<Value>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

/// 생성기 출력을 정규화된 배치로 변환
pub fn normalize(raw: &Value) -> Result<PatchBatch> {
    let tag = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| PatchError::MalformedInput("missing producer tag 'type'".to_string()))?;
    let producer = Producer::parse(tag)
        .ok_or_else(|| PatchError::MalformedInput(format!("unrecognized producer tag '{}'", tag)))?;

    let output: FactoryOutput = serde_json::from_value(raw.clone())
        .map_err(|e| PatchError::MalformedInput(format!("invalid {} output: {}", tag, e)))?;

    if output.operations.is_empty() {
        return Err(PatchError::MalformedInput(
            "producer output contains no operations".to_string(),
        ));
    }

    let operations = output
        .operations
        .iter()
        .enumerate()
        .map(|(index, value)| normalize_operation(index, value))
        .collect::<Result<Vec<_>>>()?;

    let order_id = output.order_id.filter(|id| !id.trim().is_empty());
    let id = order_id
        .clone()
        .unwrap_or_else(|| format!("patch-{}", uuid::Uuid::new_v4().simple()));

    let mut metadata = output.metadata;
    metadata.insert("producer".to_string(), json!(producer.as_str()));
    if let Some(order_id) = order_id {
        metadata.insert("orderId".to_string(), json!(order_id));
    }
    metadata.insert("operationCount".to_string(), json!(operations.len()));

    PatchBatch::new(id, operations, metadata)
}

fn normalize_operation(index: usize, value: &Value) -> Result<Operation> {
    let raw: RawOperation = serde_json::from_value(value.clone())
        .map_err(|e| PatchError::MalformedInput(format!("operation {}: {}", index, e)))?;

    let missing = |field: &str| {
        PatchError::MalformedInput(format!(
            "operation {} ({:?}) is missing required field '{}'",
            index, raw.kind, field
        ))
    };

    let target = raw
        .target
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| missing("target"))?;

    let mut op = Operation::new(raw.kind.canonical(), target);

    match raw.kind {
        ChangeKind::Create | ChangeKind::Update => {
            let content = raw.content.clone().ok_or_else(|| missing("content"))?;
            op = op.with_value(content);
        }
        ChangeKind::Move | ChangeKind::Copy => {
            let source = raw
                .source
                .clone()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| missing("source"))?;
            op = op.with_from(source);
        }
        ChangeKind::Delete => {}
    }

    op.position = raw.position;
    op.block = raw.marker;
    op.task_id = raw.task_id;

    Ok(op)
}

/// 대상 파일 경로별로 작업을 나눔
///
/// 그룹 순서는 경로가 처음 나온 순서, 그룹 안의 순서는 입력 순서를 따릅니다.
pub fn group_operations(operations: Vec<Operation>) -> Result<Vec<PatchBatch>> {
    let mut groups: Vec<(String, Vec<Operation>)> = Vec::new();

    for op in operations {
        match groups.iter_mut().find(|(path, _)| *path == op.path) {
            Some((_, ops)) => ops.push(op),
            None => groups.push((op.path.clone(), vec![op])),
        }
    }

    groups
        .into_iter()
        .map(|(path, ops)| {
            let mut metadata = Map::new();
            metadata.insert("groupPath".to_string(), json!(path));
            PatchBatch::new(format!("group-{}", short_hash(&path)), ops, metadata)
        })
        .collect()
}

/// 여러 배치를 하나로 합치고 출처를 기록
pub fn merge_batches(batches: Vec<PatchBatch>) -> Result<PatchBatch> {
    if batches.is_empty() {
        return Err(PatchError::EmptyMerge);
    }

    let source_ids: Vec<String> = batches.iter().map(|b| b.id().to_string()).collect();
    let source_kinds: Vec<String> = batches
        .iter()
        .map(|b| {
            b.metadata()
                .get("producer")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        })
        .collect();

    let operations: Vec<Operation> = batches
        .into_iter()
        .flat_map(|b| b.operations().to_vec())
        .collect();

    let mut metadata = Map::new();
    metadata.insert("sourceCount".to_string(), json!(source_ids.len()));
    metadata.insert("sourceKinds".to_string(), json!(source_kinds));
    metadata.insert("sourceIds".to_string(), json!(source_ids));

    let id = format!("merged-{}", short_hash(&source_ids.join("\n")));
    PatchBatch::new(id, operations, metadata)
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|b| format!("{:02x}", b))
        .collect()
}
