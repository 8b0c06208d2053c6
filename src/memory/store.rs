//! 长期语义记忆索引
//!
//! 每条 [`MemoryRecord`] 带有文本、向量、作用域（user / agent / session）和标量元数据，
//! 保存在容器的 `<name>_memory` 索引中。检索时先由后端按作用域过滤做 k-NN 召回，
//! 再在本地按余弦相似度重新排序，相同分数时较新的记录排在前面。
//!
//! ## 内容去重
//!
//! 开启 `dedup_by_content_hash` 后，同一作用域下文本相同的记录只保留一条：
//! 文档 id 由作用域和内容哈希确定，重复写入只刷新 `metadata` 与 `created_at`。
//!
//! ```rust,no_run
//! use agentic_memory::memory::{LongTermMemoryIndex, MemoryRecord, MemoryScope};
//!
//! # async fn example(index: &LongTermMemoryIndex, embedding: Vec<f32>) -> agentic_memory::error::Result<()> {
//! let scope = MemoryScope::new().with_user("alice");
//! index.upsert(MemoryRecord::new(scope.clone(), "user likes jazz", embedding.clone())).await?;
//! let hits = index.search(&embedding, &scope, 3).await?;
//! # Ok(())
//! # }
//! ```

use crate::backend::{DocumentBackend, FieldFilter, SearchQuery, WriteCondition, WriteOutcome};
use crate::config::{MemoryIndexConfig, ScopeConfig};
use crate::error::{MemoryError, Result};
use crate::memory::container::{ContainerManager, ContainerSchema, MemoryContainer, decode};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// 单次检索允许的最大 k
pub const MAX_K: usize = 50;

/// 同分扩池时候选池的上限
const MAX_CANDIDATE_POOL: usize = 1_000;

/// 去重写入在版本竞争下的最大尝试次数
const MAX_DEDUP_ATTEMPTS: u32 = 3;

// ── 数据类型 ──────────────────────────────────────────────────────────────────

/// 记忆作用域；作为检索过滤条件时，只有存在的字段参与匹配
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl MemoryScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn filters(&self) -> Vec<FieldFilter> {
        [
            ("scope.user_id", &self.user_id),
            ("scope.agent_id", &self.agent_id),
            ("scope.session_id", &self.session_id),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.as_ref().map(|v| FieldFilter::term(field, v.as_str())))
        .collect()
    }
}

impl From<&ScopeConfig> for MemoryScope {
    fn from(config: &ScopeConfig) -> Self {
        Self {
            user_id: config.user_id.clone(),
            agent_id: config.agent_id.clone(),
            session_id: config.session_id.clone(),
        }
    }
}

/// 元数据标量值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl TryFrom<&Value> for MetadataValue {
    type Error = MemoryError;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(MetadataValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(MetadataValue::Integer)
                .or_else(|| n.as_f64().map(MetadataValue::Float))
                .ok_or_else(|| MemoryError::Validation(format!("unsupported number {n}"))),
            Value::String(s) => Ok(MetadataValue::Text(s.clone())),
            other => Err(MemoryError::Validation(format!(
                "metadata values must be scalars, got {other}"
            ))),
        }
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// 把 JSON 对象转换为元数据；`null` 视为空
pub fn metadata_from_json(value: &Value) -> Result<Metadata> {
    match value {
        Value::Null => Ok(Metadata::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), MetadataValue::try_from(v)?)))
            .collect(),
        other => Err(MemoryError::Validation(format!(
            "metadata must be an object, got {other}"
        ))),
    }
}

/// 一条长期记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    /// 写入时由索引填充
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub scope: MemoryScope,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(scope: MemoryScope, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: String::new(),
            scope,
            text: text.into(),
            embedding,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 检索结果
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
}

/// 远端文档格式：记录本身加上内容哈希
#[derive(Serialize, Deserialize)]
struct StoredMemory {
    #[serde(flatten)]
    record: MemoryRecord,
    content_hash: String,
}

// ── LongTermMemoryIndex ───────────────────────────────────────────────────────

pub struct LongTermMemoryIndex {
    manager: Arc<ContainerManager>,
    backend: Arc<dyn DocumentBackend>,
    retry: RetryPolicy,
    config: MemoryIndexConfig,
    container: OnceCell<MemoryContainer>,
}

impl LongTermMemoryIndex {
    /// 构建索引；容器在第一次写入时才会创建
    pub fn new(manager: Arc<ContainerManager>, config: MemoryIndexConfig) -> Self {
        Self {
            backend: manager.backend(),
            retry: manager.retry().clone(),
            manager,
            config,
            container: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &MemoryIndexConfig {
        &self.config
    }

    fn schema(&self) -> ContainerSchema {
        ContainerSchema::new(self.config.dimension, self.config.metric)
    }

    async fn ensured_container(&self) -> Result<&MemoryContainer> {
        self.container
            .get_or_try_init(|| self.manager.ensure(&self.config.container_name, self.schema()))
            .await
    }

    /// 写入一条记录，返回记录 id
    pub async fn upsert(&self, mut record: MemoryRecord) -> Result<String> {
        if record.text.trim().is_empty() {
            return Err(MemoryError::Validation("memory text must not be empty".to_string()));
        }
        validate_vector(&record.embedding, self.config.dimension, "embedding")?;

        let container = self.ensured_container().await?;
        record.container_id = container.id.clone();
        let index = container.memory_index();
        let content_hash = content_hash(&record.text);

        if !self.config.dedup_by_content_hash {
            if record.id.is_empty() {
                record.id = uuid::Uuid::new_v4().to_string();
            }
            let id = record.id.clone();
            let scope = record.scope.clone();
            let doc = serde_json::to_value(StoredMemory {
                record,
                content_hash: content_hash.clone(),
            })?;
            if let WriteOutcome::VersionConflict =
                self.put(&index, &id, &doc, WriteCondition::CreateOnly).await?
            {
                // 记录写入后不可变：只有同一内容的重试写入才算成功
                let existing = match self.get(&index, &id).await? {
                    Some(current) => Some(decode::<StoredMemory>(current.source)?),
                    None => None,
                };
                let same_write = existing
                    .is_some_and(|e| e.content_hash == content_hash && e.record.scope == scope);
                if !same_write {
                    return Err(MemoryError::Conflict(format!(
                        "memory record {id} already exists with different content"
                    )));
                }
                debug!(id = %id, "重试前的写入已落盘");
            }
            info!(id = %id, container = %self.config.container_name, "💾 记忆已写入");
            return Ok(id);
        }

        record.id = dedup_id(&record.scope, &content_hash);
        let id = record.id.clone();
        let fresh = StoredMemory {
            record,
            content_hash,
        };

        for attempt in 1..=MAX_DEDUP_ATTEMPTS {
            let existing = self.get(&index, &id).await?;
            let (doc, condition) = match existing {
                None => (serde_json::to_value(&fresh)?, WriteCondition::CreateOnly),
                Some(current) => {
                    let mut stored: StoredMemory = decode(current.source)?;
                    stored.record.metadata = fresh.record.metadata.clone();
                    stored.record.created_at = fresh.record.created_at;
                    (
                        serde_json::to_value(&stored)?,
                        WriteCondition::IfVersion(current.version),
                    )
                }
            };
            match self.put(&index, &id, &doc, condition).await? {
                WriteOutcome::Written(_) => {
                    info!(id = %id, refreshed = matches!(condition, WriteCondition::IfVersion(_)), "💾 记忆已写入（内容去重）");
                    return Ok(id);
                }
                WriteOutcome::VersionConflict => {
                    debug!(id = %id, attempt, "去重写入版本冲突，回读后重试");
                }
            }
        }
        Err(MemoryError::Conflict(format!(
            "memory record {id} kept changing during upsert"
        )))
    }

    /// 按作用域检索最相似的至多 `k` 条记录
    pub async fn search(
        &self,
        query_embedding: &[f32],
        scope: &MemoryScope,
        k: usize,
    ) -> Result<Vec<ScoredMemory>> {
        if k == 0 || k > MAX_K {
            return Err(MemoryError::Validation(format!(
                "k must be within 1..={MAX_K}, got {k}"
            )));
        }
        validate_vector(query_embedding, self.config.dimension, "query embedding")?;

        let container = match self.container.get() {
            Some(container) => container.clone(),
            None => self.manager.describe(&self.config.container_name).await?,
        };
        if container.schema.dimension != query_embedding.len() {
            return Err(MemoryError::Validation(format!(
                "query embedding has {} dimensions, container '{}' expects {}",
                query_embedding.len(),
                container.name,
                container.schema.dimension
            )));
        }

        let backend = self.backend.as_ref();
        let index = container.memory_index();
        let index = index.as_str();
        let mut pool = (k * self.config.candidate_multiplier.max(1)).min(MAX_CANDIDATE_POOL);
        let mut scored = loop {
            let mut query = SearchQuery::new(pool)
                .filter(FieldFilter::term("container_id", container.id.as_str()))
                .knn("embedding", query_embedding.to_vec(), pool)
                .sort_desc("created_at");
            for filter in scope.filters() {
                query = query.filter(filter);
            }
            let query_ref = &query;
            let hits = self
                .retry
                .run("search_memory", move || backend.search(index, query_ref))
                .await?;
            let pool_full = hits.len() >= pool;

            let mut scored = Vec::with_capacity(hits.len());
            for hit in hits {
                let stored: StoredMemory = decode(hit.source)?;
                let score = cosine_similarity(query_embedding, &stored.record.embedding);
                scored.push(ScoredMemory {
                    record: stored.record,
                    score,
                });
            }
            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            });

            // 第 k 名与候选池末尾同分时，池外可能还有更新的同分记录
            let tie_at_edge = scored.len() >= k
                && scored.last().map(|last| last.score) == Some(scored[k - 1].score);
            if pool_full && tie_at_edge && pool < MAX_CANDIDATE_POOL {
                pool = (pool * 2).min(MAX_CANDIDATE_POOL);
                debug!(k, pool, "候选池边缘存在同分记录，扩大候选池");
                continue;
            }
            break scored;
        };

        if let Some(min) = self.config.min_score {
            scored.retain(|hit| hit.score >= min);
        }
        scored.truncate(k);

        debug!(k, returned = scored.len(), "🔍 记忆检索完成");
        Ok(scored)
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<crate::backend::StoredDocument>> {
        let backend = self.backend.as_ref();
        self.retry
            .run("get_memory", move || backend.get_document(index, id))
            .await
    }

    async fn put(
        &self,
        index: &str,
        id: &str,
        doc: &Value,
        condition: WriteCondition,
    ) -> Result<WriteOutcome> {
        let backend = self.backend.as_ref();
        self.retry
            .run("put_memory", move || backend.put_document(index, id, doc, condition))
            .await
    }
}

// ── 工具函数 ──────────────────────────────────────────────────────────────────

/// 余弦相似度；任一向量范数为 0 或长度不同时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// 文本的 SHA-256（十六进制）
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn dedup_id(scope: &MemoryScope, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [&scope.user_id, &scope.agent_id, &scope.session_id] {
        match part {
            Some(value) => {
                hasher.update(b"1");
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update(b"0"),
        }
    }
    hasher.update(content_hash.as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_vector(vector: &[f32], dimension: usize, what: &str) -> Result<()> {
    if vector.is_empty() {
        return Err(MemoryError::Validation(format!("{what} must not be empty")));
    }
    if vector.len() != dimension {
        return Err(MemoryError::Validation(format!(
            "{what} has {} dimensions, expected {dimension}",
            vector.len()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::Validation(format!("{what} contains non-finite values")));
    }
    Ok(())
}
