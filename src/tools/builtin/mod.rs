//! 内置工具

pub mod memory;

pub use memory::{MemoryToolProvider, SearchMemoryTool, StoreMemoryTool};
