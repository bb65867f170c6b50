//! Telemetry agent entry point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::io::{AsyncBufReadExt, BufReader};

use telemetry_agent::config::{load_context, resolve_declaration_path, resolve_fixtures_dir};
use telemetry_agent::{Agent, CycleReport};
use telemetry_core::{CollectorConfig, Declaration};

#[derive(Parser)]
#[command(
    name = "telemetry-agent",
    about = "Declarative stats collection against recorded endpoint responses",
    version
)]
struct Cli {
    /// Path to the declaration JSON file.
    #[arg(short, long)]
    declaration: Option<String>,

    /// Directory of recorded endpoint responses.
    #[arg(short, long)]
    fixtures: Option<String>,

    /// Path to a device context JSON file.
    #[arg(long)]
    context: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run collection cycles and print each result as JSON (default).
    Collect {
        /// Seconds between cycles. Runs a single cycle when omitted.
        #[arg(short, long)]
        interval: Option<u64>,

        /// Number of concurrent workers.
        #[arg(long)]
        workers: Option<usize>,

        /// Pretty-print the JSON output.
        #[arg(long)]
        pretty: bool,
    },

    /// Check that every property in the declaration compiles.
    Validate,

    /// Read event lines from stdin and print them after data actions.
    Events,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   telemetry-agent completions bash > ~/.local/share/bash-completion/completions/telemetry-agent
    ///   telemetry-agent completions zsh > ~/.zfunc/_telemetry-agent
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let declaration_path = resolve_declaration_path(cli.declaration.as_deref());
    let context_path = cli.context.as_deref().map(PathBuf::from);

    match cli.command.unwrap_or(Commands::Collect {
        interval: None,
        workers: None,
        pretty: false,
    }) {
        Commands::Collect {
            interval,
            workers,
            pretty,
        } => {
            let fixtures_dir = resolve_fixtures_dir(cli.fixtures.as_deref());
            let mut config = CollectorConfig::from_env();
            if let Some(workers) = workers {
                config.workers = workers.max(1);
            }
            let agent = Agent::from_paths(
                &declaration_path,
                &fixtures_dir,
                context_path.as_deref(),
                config,
            )
            .with_context(|| format!("cannot start collection from {}", declaration_path.display()))?;

            let stop = agent.stop_signal();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, stopping");
                    stop.request_stop();
                }
            });

            let print = |report: &CycleReport| {
                let rendered = if pretty {
                    serde_json::to_string_pretty(report)
                } else {
                    serde_json::to_string(report)
                };
                match rendered {
                    Ok(text) => println!("{text}"),
                    Err(e) => tracing::error!("cannot serialize cycle {}: {e}", report.cycle_id),
                }
            };

            match interval {
                Some(secs) => {
                    agent
                        .run_every(Duration::from_secs(secs.max(1)), print)
                        .await;
                }
                None => print(&agent.run_cycle().await),
            }
        }

        Commands::Validate => {
            let result = Declaration::from_file(&declaration_path).map_err(anyhow::Error::from).and_then(
                |declaration| {
                    let context = load_context(context_path.as_deref())?;
                    let enabled = declaration.validate(&context)?;
                    Ok((declaration, enabled))
                },
            );
            match result {
                Ok((declaration, enabled)) => {
                    println!("Valid declaration: {}", declaration_path.display());
                    println!("  Stats: {}", declaration.stats.len());
                    println!("  Enabled: {enabled}");
                    println!("  Tag definitions: {}", declaration.definitions.len());
                    println!("  Data actions: {}", declaration.actions.len());
                }
                Err(e) => {
                    eprintln!("Invalid declaration: {e}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Events => {
            let declaration = Declaration::from_file(&declaration_path)
                .with_context(|| format!("cannot load {}", declaration_path.display()))?;
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let event = telemetry_core::process_event(
                    &line,
                    &declaration.actions,
                    &declaration.definitions,
                );
                println!("{}", serde_json::to_string(&event)?);
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "telemetry-agent", &mut std::io::stdout());
        }
    }

    Ok(())
}
