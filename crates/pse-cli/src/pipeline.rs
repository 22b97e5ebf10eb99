/// Training and run-inspection entry points behind the CLI subcommands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use icdar::{IcdarDataset, SyntheticDataset};
use psenet::training::{read_events, SummaryEvent};
use psenet::{train, DeviceSet, TrainReport};
use serde::Serialize;

use crate::config::{build_dataset_config, build_training_config, load_train_toml, TrainOverrides};

type TrainBackend = Autodiff<NdArray<f32>>;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the training config TOML file.
    pub config: PathBuf,
    /// ICDAR-layout dataset root (`img/` and `gt/`).
    pub data_dir: Option<PathBuf>,
    /// Train on this many generated samples instead of a dataset on disk.
    pub synthetic: Option<usize>,
    /// Parameter file overlaid before re-initialisation.
    pub pretrained: Option<PathBuf>,
    /// Number of CPU replicas the batch is split across.
    pub devices: usize,
    /// Force augmentation on regardless of the config file.
    pub augment: bool,
    /// CLI values that take priority over the TOML file.
    pub overrides: TrainOverrides,
}

/// Arguments for the `summary` subcommand.
#[derive(Debug)]
pub struct SummaryArgs {
    /// Checkpoint directory of a run.
    pub ckpt: PathBuf,
    /// Output as JSON instead of human-readable text.
    pub json: bool,
}

/// Train PSENet and write checkpoints, events and images into the checkpoint directory.
pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainReport> {
    let start = Instant::now();

    // 1. Resolve configuration
    let toml = load_train_toml(&args.config)?;
    let config = build_training_config(&toml, &args.overrides);
    let data_config = build_dataset_config(&toml.data, config.model.num_kernels, args.augment);

    // 2. Devices
    anyhow::ensure!(args.devices > 0, "--devices must be at least 1");
    let devices = DeviceSet::<TrainBackend>::new(vec![NdArrayDevice::Cpu; args.devices])?;

    // 3. Dataset and run
    let span = tracing::info_span!("train", ckpt = %config.checkpoint_dir);
    let pretrained = args.pretrained.as_deref();
    let (_, report) = match (&args.data_dir, args.synthetic) {
        (Some(dir), _) => {
            let dataset = IcdarDataset::open(dir, data_config)?;
            tracing::info!(root = %dir.display(), samples = dataset.annotations().len(), "Opened dataset");
            train(&config, dataset, pretrained, &devices, span)?
        }
        (None, Some(n)) => {
            tracing::info!(samples = n, "Using synthetic dataset");
            train(&config, SyntheticDataset::new(n, data_config), pretrained, &devices, span)?
        }
        (None, None) => anyhow::bail!("either --data-dir or --synthetic is required"),
    };

    // 4. Print summary
    println!("\n--- Training Summary ---");
    println!("Epochs: {}", report.epochs);
    println!("Updates: {}/{}", report.updates, report.max_update);
    if let Some(loss) = report.epoch_losses.last() {
        println!("Final epoch loss: {loss:.4}");
    }
    if let Some(path) = report.checkpoints.last() {
        println!("Last checkpoint: {}", path.display());
    }
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());

    Ok(report)
}

/// What a finished or running training directory contains.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub checkpoints: Vec<String>,
    pub events: usize,
    pub images: usize,
    /// Highest step seen in any event.
    pub last_step: Option<usize>,
    /// Latest value of each scalar tag.
    pub scalars: BTreeMap<String, f64>,
}

/// Collect checkpoint files and the latest scalars from a checkpoint directory.
pub fn summarize(ckpt: &Path) -> anyhow::Result<RunSummary> {
    let mut summary = RunSummary::default();

    for entry in std::fs::read_dir(ckpt)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with("model_") && name.ends_with(".param") {
            summary.checkpoints.push(name);
        }
    }
    // model_10 sorts after model_9
    summary
        .checkpoints
        .sort_by_key(|n| n["model_".len()..n.len() - ".param".len()].parse::<usize>().unwrap_or(usize::MAX));

    for event in read_events(ckpt)? {
        summary.events += 1;
        summary.last_step = summary.last_step.max(Some(event.step()));
        match event {
            SummaryEvent::Scalar { tag, value, .. } => {
                summary.scalars.insert(tag, value);
            }
            SummaryEvent::Image { .. } => summary.images += 1,
        }
    }
    Ok(summary)
}

/// Print the contents of a checkpoint directory.
pub fn run_summary(args: SummaryArgs) -> anyhow::Result<()> {
    let summary = summarize(&args.ckpt)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("--- Run Summary ---");
    println!("Directory: {}", args.ckpt.display());
    println!("Checkpoints: {}", summary.checkpoints.len());
    if let Some(last) = summary.checkpoints.last() {
        println!("Latest: {last}");
    }
    println!("Events: {} ({} images)", summary.events, summary.images);
    if let Some(step) = summary.last_step {
        println!("Last step: {step}");
    }
    for (tag, value) in &summary.scalars {
        println!("  {tag}: {value:.4}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_toml(dir: &Path) -> PathBuf {
        let path = dir.join("train.toml");
        let ckpt = dir.join("ckpt");
        let contents = format!(
            r#"
[train]
epochs = 2
batch_size = 1
verbose_step = 1
checkpoint_dir = "{}"

[model]
backbone_width = 4
blocks_per_stage = [1, 1, 1, 1]
fpn_channels = 4

[data]
input_size = 32
"#,
            ckpt.display()
        );
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn args(config: PathBuf) -> TrainArgs {
        TrainArgs {
            config,
            data_dir: None,
            synthetic: Some(4),
            pretrained: None,
            devices: 2,
            augment: false,
            overrides: TrainOverrides::default(),
        }
    }

    #[test]
    fn test_synthetic_run_then_summary() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_train(args(tiny_toml(dir.path()))).unwrap();
        assert_eq!(report.epochs, 2);
        assert_eq!(report.updates, 4);

        let summary = summarize(&dir.path().join("ckpt")).unwrap();
        assert_eq!(summary.checkpoints, vec!["model_0.param", "model_1.param"]);
        assert_eq!(summary.last_step, Some(6));
        assert!(summary.scalars.contains_key("loss"));
        assert!(summary.scalars.contains_key("pixel_accuracy"));
        assert_eq!(summary.images, 4 * 4);
    }

    #[test]
    fn test_cli_epochs_override_toml() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(tiny_toml(dir.path()));
        a.overrides.epochs = Some(1);
        a.devices = 1;
        let report = run_train(a).unwrap();
        assert_eq!(report.epochs, 1);
        assert_eq!(report.updates, 4);
    }

    #[test]
    fn test_requires_a_data_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(tiny_toml(dir.path()));
        a.synthetic = None;
        let err = run_train(a).unwrap_err();
        assert!(err.to_string().contains("--data-dir"));
    }

    #[test]
    fn test_zero_devices_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(tiny_toml(dir.path()));
        a.devices = 0;
        assert!(run_train(a).is_err());
    }
}
