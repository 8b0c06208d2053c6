//! 单轮对话步骤
//!
//! [`handle_turn`] 是一个与终端无关的纯步骤函数：读取线程的最新快照，追加用户输入，
//! 调用模型生成回复，再以读到的链头为父快照写入新的快照。
//!
//! 若写入时发现链头已被其他写入者推进（`Conflict`），从新的链头重新推导状态并重试一次；
//! 第二次仍冲突则把错误交给调用方。

use crate::error::{MemoryError, Result};
use crate::llm::LlmClient;
use crate::llm::types::Message;
use crate::memory::checkpointer::{CheckpointStore, ThreadState};
use tracing::{info, warn};

/// 默认的历史预览截断长度（字符）
pub const HISTORY_PREVIEW_CHARS: usize = 80;

/// 一轮对话的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub reply: Message,
    /// 本轮写入的快照序号
    pub sequence: u64,
    /// 快照中的消息总数
    pub message_count: usize,
}

/// 处理一轮用户输入
pub async fn handle_turn(
    store: &CheckpointStore,
    llm: &dyn LlmClient,
    thread_id: &str,
    input: &str,
) -> Result<TurnOutcome> {
    if input.trim().is_empty() {
        return Err(MemoryError::Validation("input must not be empty".to_string()));
    }

    let mut rederived = false;
    loop {
        let (mut state, parent) = match store.get_latest_opt(thread_id).await? {
            Some(head) => (head.state, Some(head.sequence)),
            None => (ThreadState::new(), None),
        };

        state.messages.push(Message::user(input));
        let reply = llm.generate(&state.messages).await?;
        state.messages.push(reply.clone());
        let message_count = state.messages.len();

        match store.put_checkpoint(thread_id, state, parent).await {
            Ok(sequence) => {
                info!(thread_id = %thread_id, sequence, message_count, "✅ 本轮已保存");
                return Ok(TurnOutcome {
                    reply,
                    sequence,
                    message_count,
                });
            }
            Err(MemoryError::Conflict(reason)) if !rederived => {
                warn!(thread_id = %thread_id, reason = %reason, "🔁 链头已变化，从新的链头重新推导");
                rederived = true;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 把消息历史格式化为 `[role] content` 行，内容超长时截断
pub fn history_lines(state: &ThreadState, max_chars: usize) -> Vec<String> {
    state
        .messages
        .iter()
        .map(|m| format!("[{}] {}", m.role, m.preview(max_chars)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::{CheckpointConfig, ContainerConfig};
    use crate::llm::types::Role;
    use crate::memory::container::ContainerManager;
    use crate::retry::RetryPolicy;
    use crate::testing::MockLlmClient;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn store() -> Arc<CheckpointStore> {
        let manager = Arc::new(ContainerManager::new(
            Arc::new(InMemoryBackend::new()),
            RetryPolicy::no_retry(),
            &ContainerConfig::default(),
        ));
        Arc::new(CheckpointStore::new(manager, CheckpointConfig::default()))
    }

    #[tokio::test]
    async fn test_turns_accumulate_history() {
        let store = store();
        let llm = MockLlmClient::new()
            .with_response("hello!")
            .with_response("still here");

        let first = handle_turn(&store, &llm, "t1", "hi").await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.reply.content, "hello!");
        assert_eq!(first.message_count, 2);

        let second = handle_turn(&store, &llm, "t1", "you there?").await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.message_count, 4);

        // 模型看到的是完整的历史
        let seen = llm.last_messages().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].content, "hi");
        assert_eq!(seen[1].role, Role::Assistant);

        let latest = store.get_latest("t1").await.unwrap();
        let lines = history_lines(&latest.state, HISTORY_PREVIEW_CHARS);
        assert_eq!(
            lines,
            vec![
                "[user] hi",
                "[assistant] hello!",
                "[user] you there?",
                "[assistant] still here"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let store = store();
        let llm = MockLlmClient::new();
        let err = handle_turn(&store, &llm, "t1", "   ").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_failure_writes_nothing() {
        let store = store();
        let llm = MockLlmClient::new().with_network_error("model offline");
        let err = handle_turn(&store, &llm, "t1", "hi").await.unwrap_err();
        assert_eq!(err.kind(), "backend_unavailable");
        assert!(store.get_latest_opt("t1").await.unwrap().is_none());
    }

    /// 第一次生成时抢先写入一个快照，模拟另一个并发的写入者
    struct InterferingLlm {
        store: Arc<CheckpointStore>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl LlmClient for InterferingLlm {
        async fn generate(&self, messages: &[Message]) -> Result<Message> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let head = self.store.get_latest("t1").await?;
                let state = head.state.with_message(Message::user("from elsewhere"));
                self.store
                    .put_checkpoint("t1", state, Some(head.sequence))
                    .await?;
            }
            Ok(Message::assistant(format!("seen {}", messages.len())))
        }
    }

    #[tokio::test]
    async fn test_conflict_rederives_from_new_head() {
        let store = store();
        handle_turn(&store, &MockLlmClient::new(), "t1", "hi").await.unwrap();

        let llm = InterferingLlm {
            store: store.clone(),
            fired: AtomicBool::new(false),
        };
        let outcome = handle_turn(&store, &llm, "t1", "again").await.unwrap();

        // 序号 2 被并发写入者占据，本轮落在 3，且包含对方的消息
        assert_eq!(outcome.sequence, 3);
        assert_eq!(outcome.reply.content, "seen 4");
        let latest = store.get_latest("t1").await.unwrap();
        assert_eq!(latest.state.messages[2].content, "from elsewhere");
        assert_eq!(latest.state.messages.len(), 5);
    }
}
