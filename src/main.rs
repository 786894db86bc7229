//! # RAG Trainer CLI (`trainer`)
//!
//! ## Usage
//!
//! ```bash
//! trainer --config ./config/trainer.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trainer serve` | Start the HTTP server |
//! | `trainer ask "<question>"` | One-shot answer with citations |
//! | `trainer chat "<question>"` | Stream an answer from a running server |
//! | `trainer check` | Validate configuration and credentials |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::bail;
use clap::{Parser, Subcommand};
use rag_trainer::client::{Ending, TrainerClient};
use rag_trainer::config;
use rag_trainer::request::parse_query;
use rag_trainer::server;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// RAG Trainer: retrieval-augmented answers over course material.
#[derive(Parser)]
#[command(
    name = "trainer",
    about = "Retrieval-augmented training assistant with streamed answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trainer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves until Ctrl-C.
    Serve,

    /// Answer one question and print the citations.
    Ask {
        question: String,

        /// Number of passages to retrieve (1-20).
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict retrieval to one course.
        #[arg(long)]
        course_id: Option<String>,

        /// Restrict retrieval to one module.
        #[arg(long)]
        module_id: Option<String>,
    },

    /// Stream an answer from a running server.
    ///
    /// Tokens are printed as they arrive. Ctrl-C aborts the stream.
    Chat {
        question: String,

        /// Server base URL.
        #[arg(long, default_value = "http://127.0.0.1:5050")]
        url: String,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation_id: Option<String>,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Load the configuration and report missing credentials.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // The streaming client talks to a server and needs no config.
    if let Commands::Chat {
        question,
        url,
        conversation_id,
        top_k,
    } = &cli.command
    {
        return run_chat(question, url, conversation_id.as_deref(), *top_k).await;
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ask {
            question,
            top_k,
            course_id,
            module_id,
        } => {
            let body = json!({
                "question": question,
                "topK": top_k,
                "course_id": course_id,
                "module_id": module_id,
            });
            let query = parse_query(&body, cfg.retrieval.default_top_k)?;
            let orchestrator = server::orchestrator_from_config(&cfg)?;
            let response = orchestrator.answer(&query).await?;

            println!("{}\n", response.answer);
            for c in &response.citations {
                let page = c
                    .page_num
                    .filter(|p| *p >= 0)
                    .map(|p| format!(" p.{}", p + 1))
                    .unwrap_or_default();
                println!(
                    "{}  {}{}  {}",
                    c.reference,
                    c.doc_id,
                    page,
                    c.path.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Check => {
            println!("Config OK: {}", cli.config.display());
            println!("  server.bind        {}", cfg.server.bind);
            println!("  openai.endpoint    {}", cfg.openai.endpoint);
            println!("  search.endpoint    {}", cfg.search.endpoint);
            println!("  search.index_name  {}", cfg.search.index_name);

            let mut missing = 0;
            for (var, key) in [
                (&cfg.openai.api_key_env, cfg.openai.api_key()),
                (&cfg.search.api_key_env, cfg.search.api_key()),
            ] {
                match key {
                    Ok(_) => println!("  {:<24} set", var),
                    Err(_) => {
                        println!("  {:<24} MISSING", var);
                        missing += 1;
                    }
                }
            }
            if missing > 0 {
                bail!("{} API key variable(s) not set", missing);
            }
        }
        Commands::Chat { .. } => unreachable!(),
    }

    Ok(())
}

async fn run_chat(
    question: &str,
    url: &str,
    conversation_id: Option<&str>,
    top_k: Option<usize>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let client = TrainerClient::new(url);
    let exchange = client
        .chat(question, conversation_id, top_k, cancel, |event| {
            if event.name == "token" {
                let data = event.data.clone().into_json();
                if let Some(t) = data["token"].as_str() {
                    print!("{}", t);
                    let _ = std::io::stdout().flush();
                }
            }
        })
        .await?;
    println!();

    if let Some(id) = &exchange.conversation_id {
        eprintln!("conversation: {}", id);
    }
    for s in &exchange.sources {
        eprintln!(
            "  {} {}",
            s["ref"].as_str().unwrap_or(""),
            s["doc_id"].as_str().unwrap_or("")
        );
    }

    match exchange.ending {
        Ending::Done => Ok(()),
        Ending::Cancelled => {
            eprintln!("(cancelled)");
            Ok(())
        }
        Ending::Error(message) => bail!("stream error: {}", message),
        Ending::Disconnected => bail!("server closed the stream early"),
    }
}
