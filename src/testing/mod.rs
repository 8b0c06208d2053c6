//! 测试基础设施
//!
//! 在不依赖真实集群、LLM 或 embedding 服务的情况下测试各组件。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockLlmClient`] | 替代真实 LLM，用于测试 [`handle_turn`](crate::agent::handle_turn) |
//! | [`MockEmbedder`] | 确定性的文本向量化，用于测试记忆工具 |
//! | [`FlakyBackend`] | 向内存后端注入网络故障与丢失的写入响应 |
//!
//! # 设计原则
//!
//! - **零网络请求**：所有 Mock 都完全在内存中运行
//! - **可脚本化**：通过 `with_response()` / `drop_next_write_acks()` 等方法精确控制行为
//! - **可观测**：通过 `call_count()` 检查调用情况

mod flaky_backend;
mod mock_embedder;
mod mock_llm;

pub use flaky_backend::FlakyBackend;
pub use mock_embedder::MockEmbedder;
pub use mock_llm::MockLlmClient;
