//! 注入故障的后端，用于测试重试与幂等路径。
//!
//! 包装一个 [`InMemoryBackend`]，可以脚本化两类故障：
//!
//! - [`fail_next_calls`](FlakyBackend::fail_next_calls)：请求在到达存储前失败（网络错误）
//! - [`drop_next_write_acks`](FlakyBackend::drop_next_write_acks)：写入已落盘，但响应丢失
//! - [`reject_next_writes`](FlakyBackend::reject_next_writes)：写入未生效，报告版本冲突
//!
//! ```rust
//! use agentic_memory::backend::{DocumentBackend, WriteCondition};
//! use agentic_memory::testing::FlakyBackend;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let backend = FlakyBackend::new();
//! backend.drop_next_write_acks(1);
//! let doc = serde_json::json!({"n": 1});
//! assert!(backend.put_document("idx", "a", &doc, WriteCondition::CreateOnly).await.is_err());
//! // 写入实际上已经生效
//! assert!(backend.get_document("idx", "a").await.unwrap().is_some());
//! # }
//! ```

use crate::backend::{
    DocumentBackend, InMemoryBackend, IndexOutcome, IndexSpec, SearchHit, SearchQuery,
    StoredDocument, WriteCondition, WriteOutcome,
};
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub struct FlakyBackend {
    inner: InMemoryBackend,
    fail_calls: AtomicU32,
    drop_acks: AtomicU32,
    reject_writes: AtomicU32,
    rejected: AtomicUsize,
    calls: AtomicUsize,
}

impl Default for FlakyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self {
            inner: InMemoryBackend::new(),
            fail_calls: AtomicU32::new(0),
            drop_acks: AtomicU32::new(0),
            reject_writes: AtomicU32::new(0),
            rejected: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// 接下来的 `n` 次调用（任意操作）直接返回网络错误
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_calls.store(n, Ordering::SeqCst);
    }

    /// 接下来的 `n` 次写入照常生效，但向调用方报告网络错误
    pub fn drop_next_write_acks(&self, n: u32) {
        self.drop_acks.store(n, Ordering::SeqCst);
    }

    /// 接下来的 `n` 次写入不落盘，直接返回 [`WriteOutcome::VersionConflict`]
    pub fn reject_next_writes(&self, n: u32) {
        self.reject_writes.store(n, Ordering::SeqCst);
    }

    /// 被 [`reject_next_writes`](FlakyBackend::reject_next_writes) 拒绝的写入次数
    pub fn rejected_write_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    /// 已收到的调用总次数（含注入失败的调用）
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    fn before_call(&self) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_calls) {
            return Err(BackendError::Network("injected failure".to_string()));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DocumentBackend for FlakyBackend {
    async fn create_index(&self, spec: &IndexSpec) -> BackendResult<IndexOutcome> {
        self.before_call()?;
        self.inner.create_index(spec).await
    }

    async fn get_document(&self, index: &str, id: &str) -> BackendResult<Option<StoredDocument>> {
        self.before_call()?;
        self.inner.get_document(index, id).await
    }

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        source: &Value,
        condition: WriteCondition,
    ) -> BackendResult<WriteOutcome> {
        self.before_call()?;
        if take_one(&self.reject_writes) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Ok(WriteOutcome::VersionConflict);
        }
        let outcome = self.inner.put_document(index, id, source, condition).await?;
        if matches!(outcome, WriteOutcome::Written(_)) && take_one(&self.drop_acks) {
            return Err(BackendError::Network("connection reset after write".to_string()));
        }
        Ok(outcome)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> BackendResult<Vec<SearchHit>> {
        self.before_call()?;
        self.inner.search(index, query).await
    }
}
