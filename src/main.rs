//! Concierge 命令行入口
//!
//! 初始化日志与指标，按配置构建 Supervisor，从 stdin 逐行读取用户输入。
//! 用法：`concierge [thread_id]`，未给出时生成新的线程 ID。

use anyhow::Context;
use concierge::config::{load_config, AppConfig};
use concierge::{observability, Supervisor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_config(None).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });
    observability::init_metrics(config.observability.metrics_listen.as_deref())
        .context("Failed to start metrics exporter")?;

    let supervisor = Supervisor::from_config(config).context("Failed to build supervisor")?;

    let thread_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match supervisor.rehydrate(&thread_id).await {
        Some(snapshot) => {
            let active = snapshot
                .active_handler
                .map(|h| h.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "resumed thread {} (active: {}, {} recent turn(s))",
                thread_id,
                active,
                snapshot.recent_turns.len()
            );
            for turn in &snapshot.recent_turns {
                println!("  {}", turn.to_line());
            }
        }
        None => println!("new thread {}", thread_id),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" || input == "/exit" {
            break;
        }
        let reply = supervisor.process_turn(&thread_id, input).await;
        println!("{}", reply.reply);
    }

    Ok(())
}
