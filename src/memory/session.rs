//! 会话记录（只追加的对话转写）
//!
//! 每个会话一份 `session:{id}` 文档，记录消息条数的提示值；每条消息一份
//! `message:{session_id}:{position:012}` 文档，位置从 1 开始。
//!
//! 追加时从提示值之后的槽位开始以"仅创建"条件写入抢占，槽位已被占用说明有并发追加者，
//! 继续向后探测。提示值只用于加速定位，更新失败不影响正确性。

use crate::backend::{DocVersion, DocumentBackend, FieldFilter, SearchQuery, WriteCondition, WriteOutcome};
use crate::config::SessionConfig;
use crate::error::{MemoryError, Result};
use crate::llm::types::Message;
use crate::memory::container::{ContainerManager, MemoryContainer, decode};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const SESSION_KIND: &str = "session";
const MESSAGE_KIND: &str = "message";
const MAX_HINT_UPDATES: u32 = 3;

#[derive(Serialize, Deserialize)]
struct SessionDocument {
    kind: String,
    container_id: String,
    session_id: String,
    message_count: u64,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct MessageDocument {
    kind: String,
    container_id: String,
    session_id: String,
    position: u64,
    append_id: String,
    #[serde(flatten)]
    message: Message,
}

pub struct SessionRepository {
    manager: Arc<ContainerManager>,
    backend: Arc<dyn DocumentBackend>,
    retry: RetryPolicy,
    config: SessionConfig,
    container: OnceCell<MemoryContainer>,
}

impl SessionRepository {
    pub fn new(manager: Arc<ContainerManager>, config: SessionConfig) -> Self {
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

    /// 会话不存在时创建；返回本次调用是否真正创建了会话
    pub async fn create_if_absent(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        let container = self.ensured_container().await?;
        let doc = serde_json::to_value(SessionDocument {
            kind: SESSION_KIND.to_string(),
            container_id: container.id.clone(),
            session_id: session_id.to_string(),
            message_count: 0,
            created_at: Utc::now(),
        })?;
        let id = session_doc_id(session_id);
        match self.put(&id, &doc, WriteCondition::CreateOnly).await? {
            WriteOutcome::Written(_) => {
                info!(session_id = %session_id, "🆕 会话已创建");
                Ok(true)
            }
            WriteOutcome::VersionConflict => Ok(false),
        }
    }

    /// 追加一条消息，返回追加后的消息条数
    ///
    /// 会话不存在时隐式创建。相同内容的消息不会被合并。
    pub async fn append_message(&self, session_id: &str, message: Message) -> Result<usize> {
        validate_session_id(session_id)?;
        let container = self.ensured_container().await?;

        let hint = match self.read_session(session_id).await? {
            Some((doc, _)) => doc.message_count,
            None => {
                self.create_if_absent(session_id).await?;
                0
            }
        };

        let append_id = uuid::Uuid::new_v4().to_string();
        let mut doc = MessageDocument {
            kind: MESSAGE_KIND.to_string(),
            container_id: container.id.clone(),
            session_id: session_id.to_string(),
            position: hint + 1,
            append_id: append_id.clone(),
            message,
        };

        // 每个被占的槽位都属于已成功的追加者，位置只会前进，因此循环必然结束
        let mut skipped = 0;
        loop {
            let id = message_doc_id(session_id, doc.position);
            let source = serde_json::to_value(&doc)?;
            match self.put(&id, &source, WriteCondition::CreateOnly).await? {
                WriteOutcome::Written(_) => {
                    debug!(session_id = %session_id, position = doc.position, "💬 消息已追加");
                    self.advance_hint(session_id, doc.position).await;
                    return Ok(doc.position as usize);
                }
                WriteOutcome::VersionConflict => {
                    if self.config.dedup_retried_appends
                        && self.slot_append_id(&id).await?.as_deref() == Some(append_id.as_str())
                    {
                        debug!(session_id = %session_id, position = doc.position, "重试前的追加已落盘");
                        self.advance_hint(session_id, doc.position).await;
                        return Ok(doc.position as usize);
                    }
                    skipped += 1;
                    if skipped >= self.config.max_slot_skips.max(1) {
                        // 提示值落后太多，直接跳到当前最后一条消息之后
                        let last = self.last_position(session_id).await?;
                        debug!(session_id = %session_id, last, "连续槽位已被占用，重新定位末尾");
                        doc.position = doc.position.max(last) + 1;
                        skipped = 0;
                    } else {
                        doc.position += 1;
                    }
                }
            }
        }
    }

    /// 按追加顺序读取全部消息；会话从未创建时返回 `NotFound`
    pub async fn read(&self, session_id: &str) -> Result<Vec<Message>> {
        validate_session_id(session_id)?;
        if self.read_session(session_id).await?.is_none() {
            return Err(MemoryError::NotFound(format!("session '{session_id}'")));
        }

        let mut messages = Vec::new();
        let mut last = 0u64;
        loop {
            let query = SearchQuery::new(self.config.page_size)
                .filter(FieldFilter::term("kind", MESSAGE_KIND))
                .filter(FieldFilter::term("session_id", session_id))
                .filter(FieldFilter::greater_than("position", last))
                .sort_asc("position");
            let page = self.search(&query).await?;
            let full_page = page.len() >= self.config.page_size;
            for doc in page {
                last = doc.position;
                messages.push(doc.message);
            }
            if !full_page {
                break;
            }
        }
        Ok(messages)
    }

    /// 尽力推进提示值；并发更新或失败都可以忽略
    async fn advance_hint(&self, session_id: &str, position: u64) {
        for _ in 0..MAX_HINT_UPDATES {
            let (mut doc, version) = match self.read_session(session_id).await {
                Ok(Some(found)) => found,
                Ok(None) => return,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "读取会话提示值失败，忽略");
                    return;
                }
            };
            if doc.message_count >= position {
                return;
            }
            doc.message_count = position;
            let Ok(source) = serde_json::to_value(&doc) else {
                return;
            };
            match self
                .put(&session_doc_id(session_id), &source, WriteCondition::IfVersion(version))
                .await
            {
                Ok(WriteOutcome::Written(_)) => return,
                Ok(WriteOutcome::VersionConflict) => continue,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "更新会话提示值失败，忽略");
                    return;
                }
            }
        }
    }

    async fn read_session(&self, session_id: &str) -> Result<Option<(SessionDocument, DocVersion)>> {
        let id = session_doc_id(session_id);
        match self.get(&id).await? {
            Some(doc) => Ok(Some((decode(doc.source)?, doc.version))),
            None => Ok(None),
        }
    }

    /// 当前最后一条消息的位置；没有消息时为 0
    async fn last_position(&self, session_id: &str) -> Result<u64> {
        let query = SearchQuery::new(1)
            .filter(FieldFilter::term("kind", MESSAGE_KIND))
            .filter(FieldFilter::term("session_id", session_id))
            .sort_desc("position");
        Ok(self
            .search(&query)
            .await?
            .first()
            .map(|doc| doc.position)
            .unwrap_or(0))
    }

    async fn slot_append_id(&self, id: &str) -> Result<Option<String>> {
        match self.get(id).await? {
            Some(doc) => Ok(Some(decode::<MessageDocument>(doc.source)?.append_id)),
            None => Ok(None),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<crate::backend::StoredDocument>> {
        let backend = self.backend.as_ref();
        let index = self.index();
        self.retry
            .run("get_session_doc", move || backend.get_document(index, id))
            .await
    }

    async fn put(&self, id: &str, doc: &Value, condition: WriteCondition) -> Result<WriteOutcome> {
        let backend = self.backend.as_ref();
        let index = self.index();
        self.retry
            .run("put_session_doc", move || backend.put_document(index, id, doc, condition))
            .await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<MessageDocument>> {
        let backend = self.backend.as_ref();
        let index = self.index();
        let hits = self
            .retry
            .run("search_messages", move || backend.search(index, query))
            .await?;
        hits.into_iter().map(|hit| decode(hit.source)).collect()
    }
}

fn session_doc_id(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn message_doc_id(session_id: &str, position: u64) -> String {
    format!("message:{session_id}:{position:012}")
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.trim().is_empty() {
        return Err(MemoryError::Validation("session_id must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::ContainerConfig;
    use crate::llm::types::Role;
    use crate::testing::FlakyBackend;

    fn repo_on(backend: Arc<dyn DocumentBackend>, config: SessionConfig) -> SessionRepository {
        let manager = Arc::new(ContainerManager::new(
            backend,
            RetryPolicy::immediate(3),
            &ContainerConfig::default(),
        ));
        SessionRepository::new(manager, config)
    }

    fn repo() -> SessionRepository {
        repo_on(Arc::new(InMemoryBackend::new()), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_create_if_absent_is_idempotent() {
        let repo = repo();
        assert!(repo.create_if_absent("s1").await.unwrap());
        assert!(!repo.create_if_absent("s1").await.unwrap());
        assert!(repo.read("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let repo = repo();
        repo.create_if_absent("s1").await.unwrap();
        assert_eq!(repo.append_message("s1", Message::user("hi")).await.unwrap(), 1);
        assert_eq!(
            repo.append_message("s1", Message::assistant("hello")).await.unwrap(),
            2
        );
        // 相同内容不去重
        assert_eq!(repo.append_message("s1", Message::user("hi")).await.unwrap(), 3);

        let messages = repo.read("s1").await.unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_read_unknown_session() {
        let err = repo().read("nobody").await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_creates_session_implicitly() {
        let repo = repo();
        assert_eq!(repo.append_message("s2", Message::system("be brief")).await.unwrap(), 1);
        assert_eq!(repo.read("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_pages_through_long_sessions() {
        let repo = repo_on(
            Arc::new(InMemoryBackend::new()),
            SessionConfig {
                page_size: 3,
                ..SessionConfig::default()
            },
        );
        for i in 0..7 {
            repo.append_message("s1", Message::user(format!("m{i}"))).await.unwrap();
        }
        let contents: Vec<String> = repo
            .read("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, (0..7).map(|i| format!("m{i}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_appends_all_land() {
        let repo = Arc::new(repo());
        repo.create_if_absent("s1").await.unwrap();
        let mut handles = Vec::new();
        for i in 0..6 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.append_message("s1", Message::user(format!("m{i}"))).await
            }));
        }
        let mut lengths = Vec::new();
        for handle in handles {
            lengths.push(handle.await.unwrap().unwrap());
        }
        lengths.sort();
        assert_eq!(lengths, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(repo.read("s1").await.unwrap().len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_appends_exceed_skip_budget() {
        let repo = Arc::new(repo_on(
            Arc::new(InMemoryBackend::new()),
            SessionConfig {
                max_slot_skips: 2,
                ..SessionConfig::default()
            },
        ));
        repo.create_if_absent("s1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..40 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.append_message("s1", Message::user(format!("m{i}"))).await
            }));
        }
        let mut positions = Vec::new();
        for handle in handles {
            positions.push(handle.await.unwrap().unwrap());
        }
        positions.sort();
        assert_eq!(positions, (1..=40).collect::<Vec<_>>());
        assert_eq!(repo.read("s1").await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_stale_hint_jumps_to_the_tail() {
        let backend = Arc::new(InMemoryBackend::new());
        let repo = repo_on(
            backend.clone(),
            SessionConfig {
                max_slot_skips: 2,
                ..SessionConfig::default()
            },
        );
        for i in 0..5 {
            repo.append_message("s1", Message::user(format!("m{i}"))).await.unwrap();
        }

        // 把提示值退回到 0，之后的追加必须越过 5 个已占槽位
        let index = SessionConfig::default().container_name;
        let mut session = backend
            .get_document(&index, "session:s1")
            .await
            .unwrap()
            .unwrap()
            .source;
        session["message_count"] = serde_json::json!(0);
        backend
            .put_document(&index, "session:s1", &session, WriteCondition::Overwrite)
            .await
            .unwrap();

        assert_eq!(repo.append_message("s1", Message::user("late")).await.unwrap(), 6);
        let messages = repo.read("s1").await.unwrap();
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[5].content, "late");
    }

    #[tokio::test]
    async fn test_lost_ack_duplicates_without_dedup() {
        let flaky = Arc::new(FlakyBackend::new());
        let repo = repo_on(flaky.clone(), SessionConfig::default());
        repo.create_if_absent("s1").await.unwrap();

        flaky.drop_next_write_acks(1);
        assert_eq!(repo.append_message("s1", Message::user("hi")).await.unwrap(), 2);
        let messages = repo.read("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, messages[1].content);
    }

    #[tokio::test]
    async fn test_lost_ack_is_recognised_with_dedup() {
        let flaky = Arc::new(FlakyBackend::new());
        let repo = repo_on(
            flaky.clone(),
            SessionConfig {
                dedup_retried_appends: true,
                ..SessionConfig::default()
            },
        );
        repo.create_if_absent("s1").await.unwrap();

        flaky.drop_next_write_acks(1);
        assert_eq!(repo.append_message("s1", Message::user("hi")).await.unwrap(), 1);
        assert_eq!(repo.read("s1").await.unwrap().len(), 1);
    }
}
