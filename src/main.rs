use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rulectl::cli::Output;
use rulectl::cli::commands::{clean, config, start, status};
use rulectl::config::RateLimitStrategy;
use rulectl::types::{RulectlError, exit_code};

#[derive(Parser)]
#[command(name = "rulectl")]
#[command(
    version,
    about = "Resumable, rate-limited analysis of a codebase into coding-convention rules"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a repository, resuming unfinished work when allowed
    Start {
        #[arg(help = "Repository to analyze (default: current directory)")]
        dir: Option<PathBuf>,
        #[arg(
            long,
            visible_alias = "continue",
            conflicts_with = "fresh",
            help = "Resume saved progress without asking"
        )]
        resume: bool,
        #[arg(long, help = "Discard saved progress and start over")]
        fresh: bool,
        #[arg(long, help = "LLM provider (anthropic, openai, ollama)")]
        provider: Option<String>,
        #[arg(long, help = "Model to use")]
        model: Option<String>,
        #[arg(long, help = "Requests allowed per minute")]
        rpm: Option<u32>,
        #[arg(long, help = "Base delay between requests in milliseconds")]
        base_delay_ms: Option<u64>,
        #[arg(long, help = "Rate limit strategy: constant, exponential, adaptive")]
        strategy: Option<RateLimitStrategy>,
        #[arg(long, help = "Items per batch")]
        batch_size: Option<usize>,
        #[arg(long, help = "Process items in one stream without batch pauses")]
        no_batching: bool,
        #[arg(long, help = "Maximum items in flight")]
        concurrency: Option<usize>,
    },

    /// Show saved analysis progress
    Status {
        #[arg(help = "Repository (default: current directory)")]
        dir: Option<PathBuf>,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Discard saved analysis progress
    Clean {
        #[arg(help = "Repository (default: current directory)")]
        dir: Option<PathBuf>,
        #[arg(long, help = "Do not ask for confirmation")]
        force: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(long, help = "Repository whose project config applies")]
        dir: Option<PathBuf>,
        #[arg(short = 'g', long, help = "Show global config file only")]
        global: bool,
        #[arg(
            short = 'f',
            long,
            default_value = "toml",
            help = "Output format: toml, json"
        )]
        format: String,
    },
    /// Show configuration file paths
    Path {
        #[arg(long, help = "Repository whose project config applies")]
        dir: Option<PathBuf>,
    },
    /// Write a default configuration file
    Init {
        #[arg(long, help = "Repository to initialize")]
        dir: Option<PathBuf>,
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n{}", console::style("━━━ PANIC ━━━").red().bold());
        eprintln!("{}", console::style("rulectl encountered an unexpected error:").red());
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "{}",
                console::style(format!(
                    "Location: {}:{}:{}",
                    location.file(),
                    location.line(),
                    location.column()
                ))
                .dim()
            );
        }
        eprintln!(
            "{}",
            console::style("Saved progress in .rulectl/ is intact; rerun with --resume").yellow()
        );
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            Output::new().error(&format!("{:#}", e));
            let code = e
                .downcast_ref::<RulectlError>()
                .map(RulectlError::exit_code)
                .unwrap_or(exit_code::FATAL);
            ExitCode::from(code)
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Start {
            dir,
            resume,
            fresh,
            provider,
            model,
            rpm,
            base_delay_ms,
            strategy,
            batch_size,
            no_batching,
            concurrency,
        } => {
            start::run(start::StartOptions {
                dir,
                resume,
                fresh,
                provider,
                model,
                rpm,
                base_delay_ms,
                strategy,
                batch_size,
                no_batching,
                concurrency,
                quiet: cli.quiet,
            })?;
        }
        Commands::Status { dir, format } => {
            status::run(dir.as_deref(), &format)?;
        }
        Commands::Clean { dir, force } => {
            clean::run(dir.as_deref(), force)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show {
                dir,
                global,
                format,
            } => {
                config::show(dir.as_deref(), global, &format)?;
            }
            ConfigAction::Path { dir } => {
                config::path(dir.as_deref())?;
            }
            ConfigAction::Init { dir, global, force } => {
                config::init(dir.as_deref(), global, force)?;
            }
        },
    }

    Ok(())
}
