//! Mock LLM 客户端，用于在不发起真实请求的情况下测试使用了 [`LlmClient`] 的组件。
//!
//! # 示例
//!
//! ```rust
//! use agentic_memory::testing::MockLlmClient;
//! use agentic_memory::llm::LlmClient;
//! use agentic_memory::llm::types::Message;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mock = MockLlmClient::new()
//!     .with_response("第一次响应")
//!     .with_response("第二次响应");
//!
//! let r1 = mock.generate(&[Message::user("hi")]).await.unwrap();
//! assert_eq!(r1.content, "第一次响应");
//! assert_eq!(mock.call_count(), 1);
//! # }
//! ```

use crate::error::{BackendError, MemoryError, Result};
use crate::llm::LlmClient;
use crate::llm::types::Message;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum MockLlmResponse {
    Content(String),
    Err(MemoryError),
}

/// 可脚本化的 Mock LLM 客户端。
///
/// 按顺序返回预设的响应；队列耗尽后回显最后一条用户消息。
/// 所有调用都被记录，可通过 [`call_count`](MockLlmClient::call_count) /
/// [`last_messages`](MockLlmClient::last_messages) 检查。
pub struct MockLlmClient {
    responses: Arc<Mutex<VecDeque<MockLlmResponse>>>,
    /// 每次调用时收到的 messages 列表，按顺序记录
    calls: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 追加一条成功响应文本
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(MockLlmResponse::Content(text.into()));
        self
    }

    /// 追加一条错误响应
    pub fn with_error(self, err: MemoryError) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(MockLlmResponse::Err(err));
        self
    }

    /// 追加一条网络错误
    pub fn with_network_error(self, msg: impl Into<String>) -> Self {
        self.with_error(MemoryError::BackendUnavailable {
            operation: "generate".to_string(),
            attempts: 1,
            source: BackendError::Network(msg.into()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// 最后一次调用时传入的 messages
    pub fn last_messages(&self) -> Option<Vec<Message>> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, messages: &[Message]) -> Result<Message> {
        self.calls.lock().unwrap().push(messages.to_vec());

        match self.responses.lock().unwrap().pop_front() {
            Some(MockLlmResponse::Content(text)) => Ok(Message::assistant(text)),
            Some(MockLlmResponse::Err(e)) => Err(e),
            None => {
                let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
                Ok(Message::assistant(format!("echo: {last}")))
            }
        }
    }
}
