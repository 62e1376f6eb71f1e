//! onboarder 命令行
//!
//! 入口：初始化日志、加载配置、组装 Onboarder，执行一个子命令。Ctrl-C 取消进行中的运行。

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use onboarder::config::load_config;
use onboarder::memory::Turn;
use onboarder::react::AgentEvent;
use onboarder::roles::DocType;
use onboarder::{observability, Onboarder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "onboarder",
    version,
    about = "Explore a repository with LLM agents and write onboarding docs"
)]
struct Cli {
    /// Extra config file layered over config/default.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Hide per-step agent progress.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a repository and write its PROJECT.md.
    Analyze {
        /// Git URL or GitHub page URL (`/tree/<branch>` selects a branch).
        url: String,
    },
    /// Generate one document for an analyzed project.
    Doc {
        project: String,
        /// overview, how_it_works, training, terms, user_journeys, troubleshooting or custom.
        doc_type: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Generate every standard document concurrently.
    Docs { project: String },
    /// Ask a question about a project.
    Ask {
        project: String,
        question: String,
        /// JSON file with earlier user/assistant turns.
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Turn a stored document into a video storyboard.
    Storyboard { project: String, artifact: String },
    /// List projects.
    Projects,
    /// Print a stored artifact.
    Show { artifact: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            ctrl_c.cancel();
        }
    });

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(event_rx, cli.quiet));

    let onboarder = Onboarder::from_config(&cfg)
        .context("Failed to create onboarder")?
        .with_cancel_token(cancel)
        .with_event_tx(event_tx);

    let result = run(&onboarder, cli.command).await;
    drop(onboarder);
    let _ = printer.await;
    result
}

async fn run(onboarder: &Onboarder, command: Command) -> Result<()> {
    match command {
        Command::Analyze { url } => {
            let project = onboarder.register_project(&url).await?;
            println!("project {} ({})", project.id, project.repo_name);
            let project_md = onboarder.analyze_project(&project.id).await?;
            println!("{project_md}");
        }
        Command::Doc {
            project,
            doc_type,
            title,
        } => {
            let Some(doc_type) = DocType::parse(&doc_type) else {
                bail!("unknown document type: {doc_type}");
            };
            let artifact = onboarder
                .generate_document(&project, doc_type, title.as_deref())
                .await?;
            println!("artifact {}\n\n{}", artifact.id, artifact.content);
        }
        Command::Docs { project } => {
            let mut failed = 0;
            for (doc_type, result) in onboarder.generate_all_documents(&project).await {
                match result {
                    Ok(artifact) => println!("{doc_type}: artifact {}", artifact.id),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{doc_type}: {e}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} document(s) failed");
            }
        }
        Command::Ask {
            project,
            question,
            history,
        } => {
            let history: Vec<Turn> = match history {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("parse {}", path.display()))?
                }
                None => Vec::new(),
            };
            let answer = onboarder
                .answer_question(&project, &question, &history)
                .await?;
            println!("{}", answer.content);
        }
        Command::Storyboard { project, artifact } => {
            let (saved, storyboard) = onboarder.generate_storyboard(&project, &artifact).await?;
            println!("artifact {} ({} slides)\n", saved.id, storyboard.slides.len());
            println!("{}", storyboard.to_json());
        }
        Command::Projects => {
            for p in onboarder.store().list_projects().await? {
                println!(
                    "{}  {:<8}  {}  {}",
                    p.id,
                    p.status.as_str(),
                    p.repo_name,
                    p.created_at.format("%Y-%m-%d %H:%M")
                );
                if let Some(err) = p.error_message {
                    println!("    error: {err}");
                }
            }
        }
        Command::Show { artifact } => {
            let Some(a) = onboarder.store().get_artifact(&artifact).await? else {
                bail!("unknown artifact: {artifact}");
            };
            println!("{} [{}] {}\n", a.id, a.role, a.created_at.format("%Y-%m-%d %H:%M"));
            println!("{}", a.content);
            if let Some(transcript) = a.transcript {
                println!("\n--- transcript ---\n{transcript}");
            }
        }
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>, quiet: bool) {
    while let Some(ev) = rx.recv().await {
        if quiet {
            continue;
        }
        match ev {
            AgentEvent::RoundStarted {
                role,
                round,
                tool_calls,
                max_tool_calls,
            } => eprintln!("[{role}] round {round} ({tool_calls}/{max_tool_calls} tool calls)"),
            AgentEvent::ToolCall { role, tool, args } => eprintln!("[{role}] -> {tool} {args}"),
            AgentEvent::ToolResult {
                role,
                tool,
                is_error,
                preview,
            } => {
                let mark = if is_error { "!" } else { "<-" };
                eprintln!("[{role}] {mark} {tool}: {}", preview.replace('\n', " "));
            }
            AgentEvent::Retry { role, reason } => eprintln!("[{role}] retrying: {reason}"),
            AgentEvent::ForcedFinish { role, tool_calls } => {
                eprintln!("[{role}] tool budget used ({tool_calls}), asking for final answer")
            }
            AgentEvent::Done {
                role,
                tool_calls,
                round_trips,
            } => eprintln!("[{role}] done: {tool_calls} tool calls, {round_trips} requests"),
        }
    }
}
