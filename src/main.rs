use agentic_memory::agent::{HISTORY_PREVIEW_CHARS, history_lines};
use agentic_memory::config::MemoryConfig;
use agentic_memory::memory::{CheckpointStore, ContainerManager, ContainerSchema, SessionRepository};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// 检查与初始化 OpenSearch 上的智能体记忆
#[derive(Parser, Debug)]
#[command(name = "agentic-memory", version, about, long_about = None)]
struct Cli {
    /// YAML 配置文件；缺省时从环境变量（及 `.env`）读取
    #[arg(long, env = "AGENTIC_MEMORY_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 创建（或校验）配置中的全部容器
    Init,
    /// 显示线程最新快照中的消息历史
    History {
        thread_id: String,
    },
    /// 显示会话的完整记录
    Transcript {
        session_id: String,
    },
}

// ── 入口 ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MemoryConfig::load(path)?,
        None => MemoryConfig::from_env()?,
    };
    let manager = Arc::new(ContainerManager::from_config(&config)?);

    match cli.command {
        Commands::Init => init(&manager, &config).await?,
        Commands::History { thread_id } => {
            let store = CheckpointStore::new(manager, config.checkpoints.clone());
            history(&store, &thread_id).await?;
        }
        Commands::Transcript { session_id } => {
            let sessions = SessionRepository::new(manager, config.sessions.clone());
            for message in sessions.read(&session_id).await? {
                println!(
                    "{} [{}] {}",
                    message.created_at.format("%Y-%m-%d %H:%M:%S"),
                    message.role,
                    message.content
                );
            }
        }
    }

    Ok(())
}

async fn init(manager: &ContainerManager, config: &MemoryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let memory_schema = ContainerSchema::new(config.memory.dimension, config.memory.metric);
    let id = manager
        .ensure_container(&config.memory.container_name, memory_schema)
        .await?;
    println!("✅ 长期记忆容器 {} ({id})", config.memory.container_name);

    for name in [&config.checkpoints.container_name, &config.sessions.container_name] {
        let container = manager.ensure_default(name).await?;
        println!("✅ 状态容器 {} ({})", container.name, container.id);
    }
    Ok(())
}

async fn history(store: &CheckpointStore, thread_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Some(latest) = store.get_latest_opt(thread_id).await? else {
        println!("线程 {thread_id} 尚无快照");
        return Ok(());
    };

    println!(
        "线程 {thread_id}：快照 #{}，共 {} 条消息",
        latest.sequence,
        latest.state.messages.len()
    );
    for line in history_lines(&latest.state, HISTORY_PREVIEW_CHARS) {
        println!("  {line}");
    }
    Ok(())
}
