mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::TrainOverrides;
use pipeline::{SummaryArgs, TrainArgs};

/// pse: PSENet text detector training on ICDAR-style data.
#[derive(Parser)]
#[command(name = "pse", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the detector and write one parameter file per epoch.
    Train {
        /// Path to training config TOML file.
        #[arg(long, default_value = "configs/train.toml")]
        config: PathBuf,
        /// Dataset root containing `img/` and `gt/`.
        #[arg(long, conflicts_with = "synthetic", required_unless_present = "synthetic")]
        data_dir: Option<PathBuf>,
        /// Train on N generated samples instead of a dataset (smoke runs).
        #[arg(long)]
        synthetic: Option<usize>,
        /// Parameter file to initialise from before group re-initialisation.
        #[arg(long)]
        pretrained: Option<PathBuf>,
        /// Number of CPU replicas each batch is split across.
        #[arg(long, default_value_t = 1)]
        devices: usize,
        /// Override number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override base learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Override weight decay.
        #[arg(long)]
        wd: Option<f64>,
        /// Override SGD momentum.
        #[arg(long)]
        momentum: Option<f64>,
        /// Override per-device batch size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override batches between summaries.
        #[arg(long)]
        verbose_step: Option<usize>,
        /// Override checkpoint directory.
        #[arg(long)]
        ckpt: Option<String>,
        /// Override RNG seed.
        #[arg(long)]
        seed: Option<u64>,
        /// Enable random flip and scale augmentation.
        #[arg(long)]
        augment: bool,
    },
    /// Print checkpoints and latest metrics of a training directory.
    Summary {
        /// Checkpoint directory of a run.
        #[arg(long, default_value = "ckpt")]
        ckpt: PathBuf,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            data_dir,
            synthetic,
            pretrained,
            devices,
            epochs,
            lr,
            wd,
            momentum,
            batch_size,
            verbose_step,
            ckpt,
            seed,
            augment,
        } => pipeline::run_train(TrainArgs {
            config,
            data_dir,
            synthetic,
            pretrained,
            devices,
            augment,
            overrides: TrainOverrides {
                epochs,
                lr,
                weight_decay: wd,
                momentum,
                batch_size,
                verbose_step,
                checkpoint_dir: ckpt,
                seed,
                ..Default::default()
            },
        })
        .map(|_| ()),
        Command::Summary { ckpt, json } => pipeline::run_summary(SummaryArgs { ckpt, json }),
    }
}
