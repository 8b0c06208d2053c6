//! 协作方接口
//!
//! 持久化层本身不调用任何模型：对话生成与文本向量化都由调用方注入。
//!
//! | trait | 用途 |
//! |-------|------|
//! | [`LlmClient`] | `generate(messages) -> message`，供 [`handle_turn`](crate::agent::handle_turn) 使用 |
//! | [`Embedder`] | `embed(text) -> vector`，供记忆工具使用 |

pub mod types;

use crate::error::Result;
use async_trait::async_trait;
use types::Message;

/// 对话生成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 根据完整的历史消息生成一条回复
    async fn generate(&self, messages: &[Message]) -> Result<Message>;
}

/// 文本向量化
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
