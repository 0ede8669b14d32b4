//! Epochal CLI — drive resumable training runs from the terminal.

mod commands;
mod demo;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Epochal: epoch scheduling, loss scaling and checkpoints for training loops
#[derive(Parser, Debug)]
#[command(name = "epochal", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train the synthetic regression task
    Train(commands::TrainArgs),
    /// List the checkpoints of an experiment
    Checkpoints {
        /// Experiment directory
        #[arg(long)]
        exp_dir: Option<PathBuf>,

        /// Configuration file path
        #[arg(long)]
        cfg: Option<PathBuf>,
    },
    /// Load and validate a single snapshot
    Inspect {
        /// Snapshot file (snapshot_<epoch>.json)
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "epochal", "epochal")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "epochal.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    match cli.command {
        Commands::Train(args) => commands::train(args).await,
        Commands::Checkpoints { exp_dir, cfg } => commands::list_checkpoints(exp_dir, cfg),
        Commands::Inspect { path } => commands::inspect(&path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_flags() {
        let cli = Cli::try_parse_from([
            "epochal", "train", "--gpu", "0-1", "--continue", "--amp", "--init-scale", "512",
            "--epochs", "3", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let overrides = args.overrides();
        assert_eq!(overrides.device.as_deref(), Some("0-1"));
        assert_eq!(overrides.continue_train, Some(true));
        assert_eq!(overrides.end_epoch, Some(3));
        assert_eq!(overrides.precision.mixed, Some(true));
        assert_eq!(overrides.precision.init_scale, Some(512.0));
    }

    #[test]
    fn test_absent_flags_do_not_override() {
        let cli = Cli::try_parse_from(["epochal", "train"]).unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let overrides = args.overrides();
        assert!(overrides.device.is_none());
        assert!(overrides.continue_train.is_none());
        assert!(overrides.precision.mixed.is_none());
    }

    #[test]
    fn test_inspect_requires_path() {
        assert!(Cli::try_parse_from(["epochal", "inspect"]).is_err());
    }
}
