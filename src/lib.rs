//! 面向智能体的持久化记忆层
//!
//! 以 OpenSearch 为共享后端，提供三种状态：线程快照链（[`memory::CheckpointStore`]）、
//! 只追加的会话记录（[`memory::SessionRepository`]）以及按作用域隔离的长期向量记忆
//! （[`memory::LongTermMemoryIndex`]）。模型与 embedding 服务通过 [`llm`] 中的 trait 注入。

pub mod agent;
pub mod backend;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod retry;
pub mod testing;
pub mod tools;

pub mod prelude {
    pub use crate::agent::{TurnOutcome, handle_turn};
    pub use crate::config::MemoryConfig;
    pub use crate::error::{MemoryError, Result};
    pub use crate::llm::types::{Message, Role};
    pub use crate::llm::{Embedder, LlmClient};
    pub use crate::memory::{
        CheckpointStore, ContainerManager, LongTermMemoryIndex, MemoryRecord, MemoryScope,
        SessionRepository, ThreadState,
    };
    pub use crate::tools::builtin::memory::MemoryToolProvider;
    pub use crate::tools::{Tool, ToolParameters, ToolResult};
}
