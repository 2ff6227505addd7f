//! Console read-eval loop for the HMLR memory engine
//!
//! `exit` or `quit` triggers a graceful drain of background tasks;
//! `garden` manually promotes every pending closed block.

mod client;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hmlr_core::ids::new_session_id;
use hmlr_core::types::ResponseStatus;
use hmlr_core::HmlrConfig;
use hmlr_memory::ConversationEngine;

use crate::client::{HashEmbedder, UnconfiguredLlm};

/// Hierarchical Memory & Long-Term Retrieval console
#[derive(Debug, Parser)]
#[command(name = "hmlr", version, about)]
struct Cli {
    /// Database location (overrides HMLR_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = HmlrConfig::default();
    if let Some(db_path) = cli.db_path {
        config = config.with_db_path(db_path);
    }

    let engine = ConversationEngine::new(
        config,
        Arc::new(UnconfiguredLlm::main()),
        Arc::new(UnconfiguredLlm::nano()),
        Arc::new(HashEmbedder::new()),
    )
    .await
    .context("engine startup failed")?;

    let session_id = new_session_id();
    info!("Session {session_id} started");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => {}
            "exit" | "quit" => break,
            "garden" => match engine.garden_now().await {
                Ok(reports) => {
                    for report in reports {
                        println!(
                            "gardened {}: {} tags, {} rules, {} packets, {} chunks embedded",
                            report.block_id,
                            report.global_tags,
                            report.section_rules,
                            report.packets,
                            report.embedded_chunks
                        );
                    }
                }
                Err(e) => eprintln!("gardening failed: {e}"),
            },
            message => {
                let response = engine.process_user_message(message, &session_id).await;
                match response.status {
                    ResponseStatus::Success | ResponseStatus::Partial => {
                        println!("{}", response.text);
                    }
                    ResponseStatus::Error => {
                        eprintln!("[error] {}", response.text);
                        if let Some(detail) = response.error {
                            eprintln!("        {detail}");
                        }
                    }
                }
            }
        }
    }

    info!("Draining background tasks before exit");
    engine.shutdown().await;
    Ok(())
}
