//! Agent 记忆工具：store_memory / search_memory
//!
//! 两个工具共享一个 [`MemoryToolProvider`]，它固定了作用域
//! （user / agent / session），并通过注入的 [`Embedder`] 把文本转换为向量。
//!
//! | 工具 | 对应操作 |
//! |------|----------|
//! | `store_memory` | `embed(text)` → `index.upsert(record)` |
//! | `search_memory` | `embed(query)` → `index.search(vector, scope, k)` |
//!
//! 输入不合法或目标不存在时，工具返回失败的 [`ToolResult`] 交给模型自行修正；
//! 后端不可用等错误则直接向上传播。

use crate::error::{MemoryError, Result};
use crate::llm::Embedder;
use crate::memory::store::{
    LongTermMemoryIndex, MAX_K, Metadata, MemoryRecord, MemoryScope, metadata_from_json,
};
use crate::tools::{Tool, ToolParameters, ToolResult};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// `search_memory` 的单条结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryHit {
    pub text: String,
    pub score: f32,
    pub metadata: Metadata,
}

// ── MemoryToolProvider ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryToolProvider {
    index: Arc<LongTermMemoryIndex>,
    embedder: Arc<dyn Embedder>,
    scope: MemoryScope,
}

impl MemoryToolProvider {
    pub fn new(index: Arc<LongTermMemoryIndex>, embedder: Arc<dyn Embedder>, scope: MemoryScope) -> Self {
        Self {
            index,
            embedder,
            scope,
        }
    }

    pub fn scope(&self) -> &MemoryScope {
        &self.scope
    }

    /// 向量化并写入一条记忆，返回记录 id
    pub async fn store_memory(&self, text: &str, metadata: Metadata) -> Result<String> {
        if text.trim().is_empty() {
            return Err(MemoryError::Validation("text must not be empty".to_string()));
        }
        let embedding = self.embedder.embed(text).await?;
        let record = MemoryRecord::new(self.scope.clone(), text, embedding).with_metadata(metadata);
        self.index.upsert(record).await
    }

    /// 向量化查询并在本作用域内检索；`k` 缺省时使用配置的默认值
    pub async fn search_memory(&self, query: &str, k: Option<usize>) -> Result<Vec<MemoryHit>> {
        if query.trim().is_empty() {
            return Err(MemoryError::Validation("query must not be empty".to_string()));
        }
        let k = k.unwrap_or(self.index.config().default_k);
        let embedding = self.embedder.embed(query).await?;
        let hits = self.index.search(&embedding, &self.scope, k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| MemoryHit {
                text: hit.record.text,
                score: hit.score,
                metadata: hit.record.metadata,
            })
            .collect())
    }

    /// 两个工具，可直接注册到 [`ToolManager`](crate::tools::ToolManager)
    pub fn tools(&self) -> Vec<Box<dyn Tool>> {
        vec![
            Box::new(StoreMemoryTool::new(self.clone())),
            Box::new(SearchMemoryTool::new(self.clone())),
        ]
    }
}

// ── StoreMemoryTool ──────────────────────────────────────────────────────────

pub struct StoreMemoryTool {
    provider: MemoryToolProvider,
}

impl StoreMemoryTool {
    pub fn new(provider: MemoryToolProvider) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Tool for StoreMemoryTool {
    fn name(&self) -> &str {
        "store_memory"
    }

    fn description(&self) -> &str {
        "将值得长期保留的信息存入记忆库（跨会话保存），例如用户偏好、重要事实、结论。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "要记住的具体内容，请简洁、完整地描述"
                },
                "metadata": {
                    "type": "object",
                    "description": "可选的标量元数据（字符串、数字或布尔值），例如 {\"source\": \"chat\"}",
                    "additionalProperties": {
                        "type": ["string", "number", "integer", "boolean"]
                    }
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, parameters: ToolParameters) -> Result<ToolResult> {
        let outcome = async {
            let text = required_str(&parameters, "text")?;
            let metadata = metadata_from_json(parameters.get("metadata").unwrap_or(&Value::Null))?;
            debug!(chars = text.chars().count(), "💡 store_memory");
            self.provider.store_memory(text, metadata).await
        }
        .await;

        match outcome {
            Ok(id) => Ok(ToolResult::success(json!({ "id": id }))),
            Err(e) => ToolResult::from_recoverable(e),
        }
    }
}

// ── SearchMemoryTool ─────────────────────────────────────────────────────────

pub struct SearchMemoryTool {
    provider: MemoryToolProvider,
}

impl SearchMemoryTool {
    pub fn new(provider: MemoryToolProvider) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Tool for SearchMemoryTool {
    fn name(&self) -> &str {
        "search_memory"
    }

    fn description(&self) -> &str {
        "在记忆库中按语义检索相关记忆，返回最相似的若干条及其相似度。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "自然语言查询，例如 \"用户喜欢什么音乐\""
                },
                "k": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_K,
                    "description": "最多返回条数（默认 5）"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, parameters: ToolParameters) -> Result<ToolResult> {
        let outcome = async {
            let query = required_str(&parameters, "query")?;
            let k = match parameters.get("k") {
                None | Some(Value::Null) => None,
                Some(v) => Some(v.as_u64().map(|n| n as usize).ok_or_else(|| {
                    MemoryError::Validation(format!("k must be a non-negative integer, got {v}"))
                })?),
            };
            debug!(query = %query, ?k, "🔍 search_memory");
            self.provider.search_memory(query, k).await
        }
        .await;

        match outcome {
            Ok(hits) => Ok(ToolResult::success(serde_json::to_value(hits)?)),
            Err(e) => ToolResult::from_recoverable(e),
        }
    }
}

fn required_str<'a>(parameters: &'a ToolParameters, key: &str) -> Result<&'a str> {
    parameters
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| MemoryError::Validation(format!("missing string parameter '{key}'")))
}
