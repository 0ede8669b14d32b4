//! Subcommand handlers.

use crate::demo::RegressionTask;
use anyhow::Context;
use epochal_core::config::{ConfigOverrides, PrecisionOverrides, TrainConfig, load_config};
use epochal_core::prefetch::Prefetcher;
use epochal_core::reference::{Features, LinearRegression, Sgd};
use epochal_core::scaler::PrecisionStrategy;
use epochal_core::scheduler::BoxedSupply;
use epochal_core::sinks::{JsonlScalarWriter, NullScalars};
use epochal_core::{CheckpointManager, EpochScheduler, RunHistory};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    /// Device ids: "0", "0,1" or an inclusive range "0-3"
    #[arg(long)]
    gpu: Option<String>,

    /// Resume from the latest checkpoint in the experiment directory
    #[arg(long = "continue")]
    continue_train: bool,

    /// Experiment directory (checkpoints live in <exp-dir>/model_dump)
    #[arg(long)]
    exp_dir: Option<PathBuf>,

    /// Enable mixed precision with dynamic loss scaling
    #[arg(long)]
    amp: bool,

    /// Initial loss scale for mixed precision
    #[arg(long)]
    init_scale: Option<f32>,

    /// Configuration file path
    #[arg(long)]
    cfg: Option<PathBuf>,

    /// Number of epochs (exclusive end epoch)
    #[arg(long)]
    epochs: Option<usize>,

    /// Samples in the synthetic task
    #[arg(long, default_value = "2048")]
    samples: usize,

    /// Feature dimension of the synthetic task
    #[arg(long, default_value = "8")]
    dim: usize,

    /// Rows per batch
    #[arg(long, default_value = "32")]
    batch_size: usize,

    /// Seed for data generation and shuffling
    #[arg(long, default_value = "42")]
    seed: u64,
}

impl TrainArgs {
    /// Flags the user actually passed, as a configuration layer.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device: self.gpu.clone(),
            end_epoch: self.epochs,
            continue_train: self.continue_train.then_some(true),
            exp_dir: self.exp_dir.clone(),
            precision: PrecisionOverrides {
                mixed: self.amp.then_some(true),
                init_scale: self.init_scale,
            },
        }
    }
}

pub async fn train(args: TrainArgs) -> anyhow::Result<()> {
    let config = load_config(args.cfg.as_deref(), Some(&args.overrides()))?;
    config.validate()?;
    let devices = config.device_ids()?;
    tracing::info!(
        ?devices,
        end_epoch = config.end_epoch,
        mixed = config.precision.mixed,
        exp_dir = %config.exp_dir.display(),
        "Starting training"
    );

    let task = RegressionTask::generate(args.samples, args.dim, args.batch_size, 0.05, args.seed);
    let (train, eval) = task.supplies(args.seed);
    let train: BoxedSupply<Features, Vec<f32>> = match config.data.prefetch_depth {
        0 => Box::new(train),
        depth => Box::new(Prefetcher::new(train, depth)),
    };

    let cancel = CancellationToken::new();
    let mut scheduler = build_scheduler(&config, &task, train, Box::new(eval), cancel.clone())?;
    if config.continue_train {
        scheduler
            .resume_latest()
            .context("--continue was given but no usable checkpoint was found")?;
    }

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current iteration");
            cancel.cancel();
        }
    });

    let result = tokio::task::spawn_blocking(move || scheduler.run()).await;
    ctrl_c.abort();
    let history = result.context("training thread panicked")??;

    print_history(&history);
    Ok(())
}

fn build_scheduler(
    config: &TrainConfig,
    task: &RegressionTask,
    train: BoxedSupply<Features, Vec<f32>>,
    eval: BoxedSupply<Features, Vec<f32>>,
    cancel: CancellationToken,
) -> anyhow::Result<EpochScheduler<LinearRegression>> {
    let scheduler = EpochScheduler::new(
        LinearRegression::new(task.dim()),
        Box::new(Sgd::new(config.lr.base_lr, 0.9)),
        train,
        eval,
        config.checkpoint_manager(),
        config.end_epoch,
    )
    .with_lr_schedule(config.lr_schedule())
    .with_precision(PrecisionStrategy::from_flag(
        config.precision.mixed,
        config.loss_scale(),
    ))
    .with_cancellation(cancel);

    let scheduler = match &config.logging.scalar_log {
        Some(path) => {
            let path = config.exp_dir.join(path);
            let writer = JsonlScalarWriter::create(&path, config.logging.scalar_flush_every)
                .with_context(|| format!("cannot open scalar log {}", path.display()))?;
            scheduler.with_scalars(writer)
        }
        None => scheduler.with_scalars(NullScalars),
    };
    Ok(scheduler)
}

fn print_history(history: &RunHistory) {
    if history.epochs.is_empty() {
        println!("Nothing to do: all epochs already completed.");
        return;
    }
    println!("\n  Epoch  Train loss  Skipped  Eval");
    for summary in &history.epochs {
        let eval = summary
            .eval_means
            .iter()
            .map(|(k, v)| format!("{k}={v:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "  {:>5}  {:>10.6}  {:>7}  {}",
            summary.epoch, summary.mean_train_loss, summary.skipped_steps, eval
        );
    }
    if let (Some(epoch), Some(loss)) = (history.best_epoch, history.best_loss) {
        println!("\n  Best epoch: {epoch} (train loss {loss:.6})");
    }
    println!("  Wall time: {:.1}s", history.total_training_time_secs);
}

pub fn list_checkpoints(exp_dir: Option<PathBuf>, cfg: Option<PathBuf>) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        exp_dir,
        ..ConfigOverrides::default()
    };
    let config = load_config(cfg.as_deref(), Some(&overrides))?;
    let manager = config.checkpoint_manager();
    let records = manager.list()?;

    if records.is_empty() {
        println!("No checkpoints in {}", manager.base_dir().display());
        return Ok(());
    }
    println!("Checkpoints in {}:", manager.base_dir().display());
    for record in records {
        println!(
            "  epoch {:>4}  {:<20} {:>10} bytes  sha256:{}  {}",
            record.epoch,
            record.file,
            record.size_bytes,
            &record.sha256[..record.sha256.len().min(12)],
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    Ok(())
}

pub fn inspect(path: &Path) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let state = CheckpointManager::new(dir).load(path)?;

    println!("Snapshot: {}", path.display());
    println!("  epoch: {}", state.current_epoch);
    match state.model_parameters.as_object() {
        Some(params) => {
            for (name, values) in params {
                let len = values.as_array().map_or(0, Vec::len);
                println!("  network.{name}: {len} values");
            }
        }
        None => println!("  network: {}", state.model_parameters),
    }
    println!(
        "  optimizer: {}",
        serde_json::to_string(&state.optimizer_state)?
    );
    Ok(())
}
