//! # Repo Lens CLI (`rlens`)
//!
//! ```bash
//! rlens --config ./config/rlens.toml init
//! rlens ingest https://github.com/acme/widget.git --branch main
//! rlens repos
//! rlens retrieve 1 "where is the config parsed?"
//! rlens ask 1 "how does ingestion handle failures?" --level expert
//! ```
//!
//! Logging goes to stderr and is filtered by `RUST_LOG` (default `info`).

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use repo_lens::app::App;
use repo_lens::config;
use repo_lens::store::Store;

/// Ask questions about a source code repository.
#[derive(Parser)]
#[command(
    name = "rlens",
    about = "Repo Lens: ingest a code repository and answer questions grounded in it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rlens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the SQLite database and schema. Idempotent.
    Init,

    /// Register a repository and ingest it in the background.
    ///
    /// Prints the repository id as soon as the job is queued, then waits
    /// for the workers to finish before exiting.
    Ingest {
        /// Clone URL.
        url: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Owning user id.
        #[arg(long, default_value_t = 1)]
        user: i64,
    },

    /// Drop a repository's files, chunks and index, then ingest it again.
    Reingest {
        repo_id: i64,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Must own the repository.
        #[arg(long, default_value_t = 1)]
        user: i64,
    },

    /// Delete a repository and everything derived from it.
    Delete { repo_id: i64 },

    /// List repositories with their file counts and status.
    Repos {
        #[arg(long, default_value_t = 1)]
        user: i64,
    },

    /// List a repository's files, or print one file's content.
    Files {
        repo_id: i64,

        /// Print this file's content instead of the listing.
        #[arg(long)]
        file: Option<i64>,
    },

    /// Show a user's repository totals and question-answering usage.
    Overview {
        #[arg(long, default_value_t = 1)]
        user: i64,
    },

    /// Show the stats snapshot of the last successful ingestion.
    Stats { repo_id: i64 },

    /// Show the chunks retrieved for a question.
    Retrieve { repo_id: i64, question: String },

    /// Answer a question about a repository.
    Ask {
        repo_id: i64,
        question: String,

        /// beginner, intermediate (default) or expert.
        #[arg(long)]
        level: Option<String>,

        #[arg(long, default_value_t = 1)]
        user: i64,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = repo_lens::db::connect(&cfg).await?;
        repo_lens::migrate::run_migrations(&pool).await?;
        pool.close().await;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let app = App::open(cfg).await?;
    let result = run(&app, cli.command).await;
    app.close().await;
    result
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {}
        Commands::Ingest { url, branch, user } => {
            let queue = app.start_queue();
            let repo = queue.submit_ingest(user, &url, &branch).await?;
            println!("started: repository {} ({})", repo.id, repo.name);
            let stats = queue.shutdown().await;
            print_ingest_result(app, repo.id, stats.failed).await?;
        }
        Commands::Reingest {
            repo_id,
            branch,
            user,
        } => {
            let queue = app.start_queue();
            let repo = match queue.submit_reingest(user, repo_id, &branch).await {
                Ok(repo) => repo,
                Err(e) => {
                    queue.shutdown().await;
                    return Err(e.into());
                }
            };
            println!("started: repository {} ({})", repo.id, repo.name);
            let stats = queue.shutdown().await;
            print_ingest_result(app, repo.id, stats.failed).await?;
        }
        Commands::Delete { repo_id } => {
            app.pipeline.delete_repository(repo_id).await?;
            println!("Deleted repository {}.", repo_id);
        }
        Commands::Repos { user } => {
            let repos = app.store.list_repositories(user).await?;
            if repos.is_empty() {
                println!("No repositories.");
            }
            for summary in repos {
                println!(
                    "{:>5}  {:<10}  {:>6} files  {}  {}",
                    summary.repository.id,
                    summary.status.as_str(),
                    summary.file_count,
                    summary.repository.name,
                    summary.repository.url
                );
            }
        }
        Commands::Files { repo_id, file } => match file {
            Some(file_id) => match app.store.get_file(repo_id, file_id).await? {
                Some(file) => print!("{}", file.content),
                None => bail!("File {} not found in repository {}", file_id, repo_id),
            },
            None => {
                for file in app.store.list_files(repo_id).await? {
                    println!("{:>6}  {:<8}  {}", file.id, file.language, file.path);
                }
            }
        },
        Commands::Overview { user } => {
            let overview = app.store.overview(user).await?;
            let usage = app.store.usage(user).await?;
            println!("repositories:   {}", overview.total_repos);
            println!("files:          {}", overview.total_files);
            println!("chunks:         {}", overview.total_chunks);
            match overview.last_ingestion.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)) {
                Some(at) => println!("last ingestion: {}", at.to_rfc3339()),
                None => println!("last ingestion: never"),
            }
            println!("queries:        {}", usage.queries);
            println!("avg latency:    {} ms", usage.avg_query_latency_ms);
            println!("tokens used:    {}", usage.token_usage);
        }
        Commands::Stats { repo_id } => match app.stats.read(repo_id)? {
            Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
            None => bail!("No stats for repository {}", repo_id),
        },
        Commands::Retrieve { repo_id, question } => {
            let retrieval = app.retriever.retrieve(repo_id, &question).await;
            if retrieval.is_empty() {
                println!("No chunks found.");
            }
            println!("mode: {:?}", retrieval.mode);
            for (rank, (content, file)) in retrieval
                .contents
                .iter()
                .zip(retrieval.files.iter())
                .enumerate()
            {
                println!("\n#{} {}\n{}", rank + 1, file, content);
            }
        }
        Commands::Ask {
            repo_id,
            question,
            level,
            user,
        } => {
            let answer = app
                .answers
                .ask(user, repo_id, &question, level.as_deref())
                .await?;
            println!("{}", answer.answer);
            if !answer.referenced_files.is_empty() {
                println!("\nReferences:");
                for file in &answer.referenced_files {
                    println!("  {}", file);
                }
            }
            println!(
                "\n({} tokens, {} ms{})",
                answer.token_usage,
                answer.latency_ms,
                if answer.cached { ", cached" } else { "" }
            );
        }
    }
    Ok(())
}

async fn print_ingest_result(app: &App, repo_id: i64, failed: usize) -> Result<()> {
    if failed > 0 || app.store.get_repository(repo_id).await?.is_none() {
        bail!("Ingestion of repository {} failed; see logs", repo_id);
    }
    match app.stats.read(repo_id)? {
        Some(stats) => println!(
            "indexed: {} files, {} chunks, avg {} tokens/chunk, {} ms",
            stats.files, stats.chunks, stats.avg_chunk_size, stats.ingestion_time_ms
        ),
        None => println!("indexed."),
    }
    Ok(())
}
