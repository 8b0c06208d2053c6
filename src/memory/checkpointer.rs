//! 执行状态快照（Checkpoint）
//!
//! 按 `thread_id` 保存每一轮结束时的完整执行状态，序号从 1 开始严格递增、无空洞，
//! 进程重启后可从最后一个被接受的快照原样恢复。
//!
//! ## 写入协议
//!
//! 第 N 个快照的文档 id 为 `checkpoint:{thread_id}:{N:012}`，以"仅创建"条件写入。
//! 调用方声明的 `parent_sequence` 即它所看到的链头：只有当 `parent + 1` 号槽位仍空时
//! 写入才会成功，因此同一父快照上的并发写入者恰好只有一个胜出。
//!
//! 每次 `put_checkpoint` 调用都会在文档中带上自己的 `write_id`。写入冲突后回读目标槽位：
//!
//! | 槽位状态 | 处理 |
//! |----------|------|
//! | 仍为空（链头未变） | 重试条件写入 |
//! | 带有本次调用的 `write_id` | 先前的尝试已落盘，直接返回 |
//! | 被其他写入者占据 | `Conflict` |
//!
//! ```rust,no_run
//! use agentic_memory::memory::{CheckpointStore, ThreadState};
//! use agentic_memory::llm::types::Message;
//!
//! # async fn example(store: &CheckpointStore) -> agentic_memory::error::Result<()> {
//! let state = ThreadState::new().with_message(Message::user("hi"));
//! let seq = store.put_checkpoint("t1", state, None).await?;
//! let latest = store.get_latest("t1").await?;
//! assert_eq!(latest.sequence, seq);
//! # Ok(())
//! # }
//! ```

use crate::backend::{DocumentBackend, FieldFilter, SearchQuery, WriteCondition, WriteOutcome};
use crate::config::CheckpointConfig;
use crate::error::{MemoryError, Result};
use crate::llm::types::Message;
use crate::memory::container::{ContainerManager, MemoryContainer, decode};
use crate::retry::RetryPolicy;
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const KIND: &str = "checkpoint";

// ── ThreadState ───────────────────────────────────────────────────────────────

/// 一轮结束时的执行状态：消息历史加上任意的状态通道
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub channels: BTreeMap<String, Value>,
}

impl ThreadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_channel(mut self, key: impl Into<String>, value: Value) -> Self {
        self.channels.insert(key.into(), value);
        self
    }
}

// ── Checkpoint ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    /// 从 1 开始的序号
    pub sequence: u64,
    /// 第一个快照为 `None`
    pub parent_sequence: Option<u64>,
    pub state: ThreadState,
    pub created_at: DateTime<Utc>,
}

/// 远端文档格式
#[derive(Serialize, Deserialize)]
struct CheckpointDocument {
    kind: String,
    container_id: String,
    write_id: String,
    #[serde(flatten)]
    checkpoint: Checkpoint,
}

// ── CheckpointStore ───────────────────────────────────────────────────────────

pub struct CheckpointStore {
    manager: Arc<ContainerManager>,
    backend: Arc<dyn DocumentBackend>,
    retry: RetryPolicy,
    config: CheckpointConfig,
    container: OnceCell<MemoryContainer>,
}

impl CheckpointStore {
    pub fn new(manager: Arc<ContainerManager>, config: CheckpointConfig) -> Self {
        Self {
            backend: manager.backend(),
            retry: manager.retry().clone(),
            manager,
            config,
            container: OnceCell::new(),
        }
    }

    fn index(&self) -> &str {
        &self.config.container_name
    }

    async fn ensured_container(&self) -> Result<&MemoryContainer> {
        self.container
            .get_or_try_init(|| self.manager.ensure_default(&self.config.container_name))
            .await
    }

    /// 追加一个快照，返回其序号
    ///
    /// `parent_sequence` 必须是调用方看到的链头；首个快照传 `None`。
    pub async fn put_checkpoint(
        &self,
        thread_id: &str,
        state: ThreadState,
        parent_sequence: Option<u64>,
    ) -> Result<u64> {
        validate_thread_id(thread_id)?;
        let container = self.ensured_container().await?;

        if let Some(parent) = parent_sequence
            && self.read(thread_id, parent).await?.is_none()
        {
            return Err(MemoryError::Conflict(format!(
                "thread '{thread_id}' has no checkpoint {parent} to build on"
            )));
        }

        let sequence = parent_sequence.map_or(1, |p| p + 1);
        let write_id = uuid::Uuid::new_v4().to_string();
        let doc = serde_json::to_value(CheckpointDocument {
            kind: KIND.to_string(),
            container_id: container.id.clone(),
            write_id: write_id.clone(),
            checkpoint: Checkpoint {
                thread_id: thread_id.to_string(),
                sequence,
                parent_sequence,
                state,
                created_at: Utc::now(),
            },
        })?;
        let id = checkpoint_id(thread_id, sequence);

        let attempts = self.config.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            match self.create(&id, &doc).await? {
                WriteOutcome::Written(_) => {
                    info!(thread_id = %thread_id, sequence, "🔖 保存 Checkpoint");
                    return Ok(sequence);
                }
                WriteOutcome::VersionConflict => {
                    match self.read_document(thread_id, sequence).await? {
                        Some(existing) if existing.write_id == write_id => {
                            debug!(thread_id = %thread_id, sequence, "重试前的写入已落盘");
                            return Ok(sequence);
                        }
                        Some(_) => {
                            warn!(thread_id = %thread_id, sequence, "⚠️ 链头已被其他写入者推进");
                            return Err(MemoryError::Conflict(format!(
                                "thread '{thread_id}' already has checkpoint {sequence}; parent {parent_sequence:?} is stale"
                            )));
                        }
                        None => {
                            debug!(thread_id = %thread_id, sequence, attempt, "链头未变，重试条件写入");
                        }
                    }
                }
            }
        }
        Err(MemoryError::Conflict(format!(
            "checkpoint {sequence} of thread '{thread_id}' not accepted after {attempts} attempts"
        )))
    }

    /// 最新快照；线程为空时返回 `NotFound`
    pub async fn get_latest(&self, thread_id: &str) -> Result<Checkpoint> {
        self.get_latest_opt(thread_id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("thread '{thread_id}' has no checkpoints")))
    }

    /// 最新快照；线程为空时返回 `None`
    pub async fn get_latest_opt(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let query = SearchQuery::new(1)
            .filter(FieldFilter::term("kind", KIND))
            .filter(FieldFilter::term("thread_id", thread_id))
            .sort_desc("sequence");
        let Some(mut latest) = self.search(&query).await?.into_iter().next() else {
            return Ok(None);
        };

        // 检索结果可能落后于实时读取，沿序号向前确认真正的链头
        while let Some(next) = self.read(thread_id, latest.sequence + 1).await? {
            latest = next;
        }
        Ok(Some(latest))
    }

    /// 按序号读取快照
    pub async fn get(&self, thread_id: &str, sequence: u64) -> Result<Checkpoint> {
        self.read(thread_id, sequence).await?.ok_or_else(|| {
            MemoryError::NotFound(format!("checkpoint {sequence} of thread '{thread_id}'"))
        })
    }

    /// 最新快照中的消息条数；未知线程为 0
    pub async fn message_count(&self, thread_id: &str) -> Result<usize> {
        Ok(self
            .get_latest_opt(thread_id)
            .await?
            .map(|cp| cp.state.messages.len())
            .unwrap_or(0))
    }

    /// 按序号升序遍历线程的全部快照
    ///
    /// 流是惰性的，每页 `page_size` 条；每次调用都会从头开始。
    pub fn list<'a>(&'a self, thread_id: &'a str) -> BoxStream<'a, Result<Checkpoint>> {
        Box::pin(try_stream! {
            let mut last = 0u64;
            loop {
                let query = SearchQuery::new(self.config.page_size)
                    .filter(FieldFilter::term("kind", KIND))
                    .filter(FieldFilter::term("thread_id", thread_id))
                    .filter(FieldFilter::greater_than("sequence", last))
                    .sort_asc("sequence");
                let page = self.search(&query).await?;
                let full_page = page.len() >= self.config.page_size;
                for checkpoint in page {
                    last = checkpoint.sequence;
                    yield checkpoint;
                }
                if !full_page {
                    break;
                }
            }
        })
    }

    async fn read(&self, thread_id: &str, sequence: u64) -> Result<Option<Checkpoint>> {
        Ok(self
            .read_document(thread_id, sequence)
            .await?
            .map(|doc| doc.checkpoint))
    }

    async fn read_document(&self, thread_id: &str, sequence: u64) -> Result<Option<CheckpointDocument>> {
        let backend = self.backend.as_ref();
        let index = self.index();
        let id = checkpoint_id(thread_id, sequence);
        let id = id.as_str();
        let doc = self
            .retry
            .run("get_checkpoint", move || backend.get_document(index, id))
            .await?;
        doc.map(|d| decode(d.source)).transpose()
    }

    async fn create(&self, id: &str, doc: &Value) -> Result<WriteOutcome> {
        let backend = self.backend.as_ref();
        let index = self.index();
        self.retry
            .run("put_checkpoint", move || {
                backend.put_document(index, id, doc, WriteCondition::CreateOnly)
            })
            .await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Checkpoint>> {
        let backend = self.backend.as_ref();
        let index = self.index();
        let hits = self
            .retry
            .run("search_checkpoints", move || backend.search(index, query))
            .await?;
        hits.into_iter()
            .map(|hit| decode::<CheckpointDocument>(hit.source).map(|doc| doc.checkpoint))
            .collect()
    }
}

fn checkpoint_id(thread_id: &str, sequence: u64) -> String {
    format!("checkpoint:{thread_id}:{sequence:012}")
}

fn validate_thread_id(thread_id: &str) -> Result<()> {
    if thread_id.trim().is_empty() {
        return Err(MemoryError::Validation("thread_id must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::ContainerConfig;
    use crate::testing::FlakyBackend;
    use futures::TryStreamExt;
    use serde_json::json;

    fn store_on(backend: Arc<dyn DocumentBackend>, config: CheckpointConfig) -> CheckpointStore {
        let manager = Arc::new(ContainerManager::new(
            backend,
            RetryPolicy::immediate(3),
            &ContainerConfig::default(),
        ));
        CheckpointStore::new(manager, config)
    }

    fn store() -> CheckpointStore {
        store_on(Arc::new(InMemoryBackend::new()), CheckpointConfig::default())
    }

    fn state(texts: &[&str]) -> ThreadState {
        texts
            .iter()
            .fold(ThreadState::new(), |s, t| s.with_message(Message::user(*t)))
    }

    #[tokio::test]
    async fn test_sequential_puts_and_latest() {
        let store = store();
        assert_eq!(store.put_checkpoint("t1", state(&["hi"]), None).await.unwrap(), 1);
        let second = state(&["hi", "hello"]);
        assert_eq!(
            store.put_checkpoint("t1", second.clone(), Some(1)).await.unwrap(),
            2
        );

        let latest = store.get_latest("t1").await.unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.parent_sequence, Some(1));
        assert_eq!(latest.state, second);
        assert_eq!(store.message_count("t1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_thread() {
        let store = store();
        let err = store.get_latest("ghost-thread").await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
        assert_eq!(store.message_count("ghost-thread").await.unwrap(), 0);
        assert!(store.get_latest_opt("ghost-thread").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_round_trips_exactly() {
        let store = store();
        let original = state(&["hi"])
            .with_message(Message::assistant("hello there"))
            .with_channel("step", json!(3))
            .with_channel("plan", json!({"todo": ["a", "b"], "done": null}));
        store.put_checkpoint("t1", original.clone(), None).await.unwrap();
        assert_eq!(store.get_latest("t1").await.unwrap().state, original);
    }

    #[tokio::test]
    async fn test_racing_writers_one_conflict() {
        let store = Arc::new(store());
        store.put_checkpoint("t1", state(&["hi"]), None).await.unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.put_checkpoint("t1", state(&["a"]), Some(1)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.put_checkpoint("t1", state(&["b"]), Some(1)).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let wins: Vec<u64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(wins, vec![2]);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(MemoryError::Conflict(_))))
        );
        assert_eq!(store.get_latest("t1").await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_stale_and_missing_parents() {
        let store = store();
        store.put_checkpoint("t1", state(&["1"]), None).await.unwrap();
        store.put_checkpoint("t1", state(&["2"]), Some(1)).await.unwrap();

        // 链头已是 2
        let err = store.put_checkpoint("t1", state(&["x"]), Some(1)).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        // 首个快照只能写一次
        let err = store.put_checkpoint("t1", state(&["x"]), None).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        // 父快照不存在
        let err = store.put_checkpoint("t1", state(&["x"]), Some(7)).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(store.get_latest("t1").await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_threads_are_independent() {
        let store = store();
        store.put_checkpoint("a", state(&["1"]), None).await.unwrap();
        store.put_checkpoint("b", state(&["1"]), None).await.unwrap();
        store.put_checkpoint("a", state(&["1", "2"]), Some(1)).await.unwrap();
        assert_eq!(store.get_latest("a").await.unwrap().sequence, 2);
        assert_eq!(store.get_latest("b").await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_list_is_ordered_paged_and_restartable() {
        let store = store_on(
            Arc::new(InMemoryBackend::new()),
            CheckpointConfig {
                page_size: 2,
                ..CheckpointConfig::default()
            },
        );
        let mut parent = None;
        for i in 0..5 {
            parent = Some(
                store
                    .put_checkpoint("t1", state(&[i.to_string().as_str()]), parent)
                    .await
                    .unwrap(),
            );
        }

        let first: Vec<u64> = store
            .list("t1")
            .map_ok(|cp| cp.sequence)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, vec![1, 2, 3, 4, 5]);

        let again: Vec<Checkpoint> = store.list("t1").try_collect().await.unwrap();
        assert_eq!(again.len(), 5);
        assert_eq!(again[2].parent_sequence, Some(2));

        let empty: Vec<Checkpoint> = store.list("ghost").try_collect().await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_lost_ack_is_idempotent() {
        let flaky = Arc::new(FlakyBackend::new());
        let store = store_on(flaky.clone(), CheckpointConfig::default());
        store.put_checkpoint("t1", state(&["hi"]), None).await.unwrap();

        // 写入落盘但响应丢失，重试时命中自己的 write_id
        flaky.drop_next_write_acks(1);
        let seq = store
            .put_checkpoint("t1", state(&["hi", "again"]), Some(1))
            .await
            .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(store.get_latest("t1").await.unwrap().state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_conflicts_exhaust_retries() {
        let flaky = Arc::new(FlakyBackend::new());
        let store = store_on(
            flaky.clone(),
            CheckpointConfig {
                max_conflict_retries: 2,
                ..CheckpointConfig::default()
            },
        );
        store.put_checkpoint("t1", state(&["hi"]), None).await.unwrap();

        // 每次条件写入都冲突，而回读时目标槽位始终为空
        flaky.reject_next_writes(10);
        let err = store
            .put_checkpoint("t1", state(&["hi", "again"]), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));
        assert_eq!(flaky.rejected_write_count(), 3);
        assert_eq!(store.get_latest("t1").await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_empty_thread_id_is_rejected() {
        let err = store().put_checkpoint("  ", ThreadState::new(), None).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
