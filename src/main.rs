use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codeloom::cli::commands::consolidate::{ConsolidateOptions, StageSelection};

#[derive(Parser)]
#[command(name = "codeloom")]
#[command(
    version,
    about = "LLM-driven chunked analysis and codebook consolidation"
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
    /// Merge, define and refine the codes of a codebook
    Consolidate {
        #[arg(help = "Codebook file (.json, .yaml or .yml)")]
        codebook: PathBuf,
        #[arg(long, short, help = "Output file (default: <input>.consolidated.<ext>)")]
        output: Option<PathBuf>,
        #[arg(long, help = "LLM provider (openai, ollama)")]
        provider: Option<String>,
        #[arg(long, help = "Model to use")]
        model: Option<String>,
        #[arg(long, help = "Shuffle seed applied before each stage")]
        seed: Option<u64>,
        #[arg(long, help = "Research question or study context quoted in prompts")]
        context: Option<String>,
        #[arg(long, help = "Skip the definition stage")]
        skip_definitions: bool,
        #[arg(long, help = "Skip the refinement stage")]
        skip_refine: bool,
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
        #[arg(
            short = 'f',
            long,
            default_value = "toml",
            help = "Output format: toml, json"
        )]
        format: String,
    },
    /// Show configuration file paths
    Path,
    /// Initialize configuration
    Init {
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

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mcodeloom encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        // Default hook prints the backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {:#}", e);
            ExitCode::FAILURE
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
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Consolidate {
            codebook,
            output,
            provider,
            model,
            seed,
            context,
            skip_definitions,
            skip_refine,
        } => {
            codeloom::cli::commands::consolidate::run(ConsolidateOptions {
                codebook,
                output,
                provider,
                model,
                seed,
                context,
                stages: StageSelection {
                    definitions: !skip_definitions,
                    refine: !skip_refine,
                },
                quiet: cli.quiet,
            })?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => {
                codeloom::cli::commands::config::show(&format)?;
            }
            ConfigAction::Path => {
                codeloom::cli::commands::config::path()?;
            }
            ConfigAction::Init { global, force } => {
                codeloom::cli::commands::config::init(global, force)?;
            }
        },
    }

    Ok(())
}
