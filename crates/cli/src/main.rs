//! CLI entry point for Transize
//!
//! Parses command line arguments, sets up logging for this invocation,
//! and runs either single-file or batch mode.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use transize::{run_batch, run_single, Config};

/// Batch video transcoder with size-aware quality targeting
#[derive(Parser, Debug)]
#[command(name = "transize")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video file to process (single-file mode; omit for batch mode)
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Profile to use for encoding
    #[arg(short, long, value_name = "NAME")]
    profile: Option<String>,

    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the output directory
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Show what would be done without processing
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Increase verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Default config file location (XDG compliant).
fn default_config_path() -> PathBuf {
    let config_dir = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    config_dir.join("transize").join("config.toml")
}

/// Install the tracing subscriber for this invocation.
///
/// RUST_LOG wins when set; otherwise the verbosity flags pick the level.
fn init_tracing(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("transize={0},transize_cli={0}", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config {}: {}", config_path.display(), err);
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(config = %config_path.display(), "configuration loaded");

    if let Some(output) = args.output {
        config.dirs.out = output;
    }

    let code = match &args.file {
        Some(file) => {
            if !file.exists() {
                eprintln!("Error: file not found: {}", file.display());
                return ExitCode::FAILURE;
            }
            run_single(&config, file, args.profile.as_deref(), args.dry_run)
        }
        None => run_batch(&config, args.dry_run),
    };

    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
