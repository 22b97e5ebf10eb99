//! PSENet training loop: data-parallel SGD with polynomial decay.
//!
//! Builds the network, overlays pretrained weights, re-initialises and
//! freezes parameter groups, then runs a fixed number of epochs. Each batch is
//! split across the device set; every shard runs forward and loss before any
//! shard runs backward, gradients are accumulated on the primary device and a
//! single optimizer step is taken per trainable group.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use icdar::{DataLoader, HostBatch, SampleSource, TargetBatch};
use indicatif::{ProgressBar, ProgressStyle};

use crate::model::bridge::{images_to_tensor, plane};
use crate::model::{
    load_pretrained, save_checkpoint, ParamGroup, ParamGroups, PretrainedReport, PseNet, PseNetConfig,
    OUTPUT_STRIDE,
};
use crate::training::device::DeviceSet;
use crate::training::loss::DiceLossWithOhem;
use crate::training::metrics::{BatchMetrics, RunningLoss};
use crate::training::parallel::{forward_then_backward, ShardStep};
use crate::training::schedule::PolySchedule;
use crate::training::summary::SummaryWriter;

/// Snapshot of the run configuration written next to the checkpoints.
pub const CONFIG_FILE: &str = "config.json";

/// Configuration for PSENet training.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 50)]
    pub epochs: usize,
    /// Base learning rate of the polynomial schedule.
    #[config(default = 1e-3)]
    pub lr: f64,
    #[config(default = 5e-4)]
    pub weight_decay: f64,
    #[config(default = 0.9)]
    pub momentum: f64,
    /// Samples per device; the global batch is this times the device count.
    #[config(default = 4)]
    pub batch_size: usize,
    /// Batches between image and scalar summaries. 0 disables them.
    #[config(default = 5)]
    pub verbose_step: usize,
    /// Receives `model_<epoch>.param`, `config.json` and the summary events.
    #[config(default = "String::from(\"ckpt\")")]
    pub checkpoint_dir: String,
    #[config(default = "PseNetConfig::new()")]
    pub model: PseNetConfig,
    /// Text-map weight in the loss; kernels get `1 - lam`.
    #[config(default = 0.7)]
    pub lam: f64,
    #[config(default = 3.0)]
    pub ohem_ratio: f64,
    #[config(default = 2.0)]
    pub lr_power: f64,
    /// Seeds the backend RNG (weight init) and the loader shuffle.
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = "ParamGroups::default()")]
    pub param_groups: ParamGroups,
}

impl TrainingConfig {
    pub fn global_batch(&self, devices: usize) -> usize {
        self.batch_size * devices
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub epochs: usize,
    /// Optimizer steps taken.
    pub updates: usize,
    /// Update budget of the learning-rate schedule.
    pub max_update: usize,
    /// Scheduled rate used for each update, in order.
    pub learning_rates: Vec<f64>,
    /// Mean batch loss per epoch.
    pub epoch_losses: Vec<f64>,
    pub checkpoints: Vec<PathBuf>,
    pub pretrained: Option<PretrainedReport>,
}

/// Summary step of batch `batch_idx` in `epoch`, counted in samples.
pub fn global_step(dataset_len: usize, epoch: usize, batch_idx: usize, global_batch: usize) -> usize {
    dataset_len * epoch + batch_idx * global_batch
}

/// Build the network and apply the initialisation policy.
///
/// Order: fresh init, pretrained overlay (partial), group re-initialisation,
/// freezing. Re-initialisation therefore wins over pretrained values.
pub fn prepare_model<B: Backend>(
    config: &TrainingConfig,
    pretrained: Option<&Path>,
    device: &B::Device,
) -> anyhow::Result<(PseNet<B>, Option<PretrainedReport>)> {
    let model = config.model.init::<B>(device);
    let (model, report) = match pretrained {
        Some(path) => {
            let (model, report) = load_pretrained(model, path, device)?;
            (model, Some(report))
        }
        None => {
            tracing::warn!("No pretrained weights given, backbone keeps its random initialisation");
            (model, None)
        }
    };
    let model = model
        .reinit_groups(&config.param_groups, device)
        .freeze_groups(&config.param_groups);
    Ok((model, report))
}

/// Values kept from the last shard's forward pass for logging.
struct ShardSnapshot<I: Backend> {
    c_loss: f64,
    kernel_loss: f64,
    pixel_acc: f64,
    kernel_acc: f64,
    logits: Tensor<I, 4>,
    targets: TargetBatch,
}

fn take_group_grads<B: AutodiffBackend>(
    model: &PseNet<B>,
    group: ParamGroup,
    grads: &mut B::Gradients,
) -> GradientsParams {
    match group {
        ParamGroup::Backbone => GradientsParams::from_module(grads, &model.resnet),
        ParamGroup::Decoder => GradientsParams::from_module(grads, &model.decoder),
        ParamGroup::Extra => GradientsParams::from_module(grads, &model.extra),
    }
}

/// One replica of the model per device; gradients land on the primary.
struct ReplicaStep<'a, B: AutodiffBackend> {
    master: &'a PseNet<B>,
    replicas: Vec<PseNet<B>>,
    devices: Vec<B::Device>,
    loss: &'a DiceLossWithOhem,
    global_batch: usize,
    groups: Vec<(ParamGroup, GradientsAccumulator<PseNet<B>>)>,
    last: Option<ShardSnapshot<B::InnerBackend>>,
}

impl<'a, B: AutodiffBackend> ReplicaStep<'a, B> {
    fn new(
        master: &'a PseNet<B>,
        devices: &DeviceSet<B>,
        loss: &'a DiceLossWithOhem,
        global_batch: usize,
        trainable: &[ParamGroup],
    ) -> Self {
        Self {
            master,
            replicas: devices.iter().map(|d| master.clone().fork(d)).collect(),
            devices: devices.iter().cloned().collect(),
            loss,
            global_batch,
            groups: trainable
                .iter()
                .map(|&g| (g, GradientsAccumulator::new()))
                .collect(),
            last: None,
        }
    }

    /// Accumulated gradients per trainable group plus the logging snapshot.
    #[allow(clippy::type_complexity)]
    fn finish(
        self,
    ) -> anyhow::Result<(Vec<(ParamGroup, GradientsParams)>, ShardSnapshot<B::InnerBackend>)> {
        let snapshot = self
            .last
            .ok_or_else(|| anyhow::anyhow!("batch produced no shards"))?;
        let grads = self
            .groups
            .into_iter()
            .map(|(g, mut acc)| (g, acc.grads()))
            .collect();
        Ok((grads, snapshot))
    }
}

impl<B: AutodiffBackend> ShardStep for ReplicaStep<'_, B> {
    type Shard = HostBatch;
    type Pending = Tensor<B, 1>;

    fn forward(&mut self, device_index: usize, shard: HostBatch) -> anyhow::Result<Tensor<B, 1>> {
        let replica = &self.replicas[device_index];
        let images = images_to_tensor::<B>(&shard, &self.devices[device_index]);
        let targets = shard.targets.downsample(OUTPUT_STRIDE);

        let logits = replica.forward(images);
        let out = self.loss.forward(logits.clone(), &targets)?;

        self.last = Some(ShardSnapshot {
            c_loss: out.c_loss.mean().into_scalar().elem(),
            kernel_loss: out.kernel_loss.mean().into_scalar().elem(),
            pixel_acc: out.pixel_acc,
            kernel_acc: out.kernel_acc,
            logits: logits.inner(),
            targets,
        });
        Ok(out.loss)
    }

    fn backward(&mut self, device_index: usize, loss: Tensor<B, 1>) -> anyhow::Result<f64> {
        let mean: f64 = loss.clone().mean().into_scalar().elem();
        // Gradients are normalised by the global batch, not the shard.
        let mut grads = loss.sum().div_scalar(self.global_batch as f64).backward();

        let replica = &self.replicas[device_index];
        let primary = &self.devices[0];
        for (group, acc) in self.groups.iter_mut() {
            let shard_grads = take_group_grads(replica, *group, &mut grads).to_device(primary, self.master);
            acc.accumulate(self.master, shard_grads);
        }
        Ok(mean)
    }
}

fn write_summary<I: Backend>(
    summary: &mut SummaryWriter,
    metrics: &BatchMetrics,
    snapshot: &ShardSnapshot<I>,
    step: usize,
) -> anyhow::Result<()> {
    let t = &snapshot.targets;
    let (h, w) = (t.height, t.width);
    let [_, k, _, _] = snapshot.logits.dims();
    let prob = sigmoid(snapshot.logits.clone());

    summary.add_image("score_map", &t.score_maps[..h * w], h, w, step)?;
    summary.add_image("score_map_pred", &plane(prob.clone(), 0, k - 1)?, h, w, step)?;
    if t.num_kernel_maps > 0 {
        summary.add_image("kernel_map", &t.kernels[..h * w], h, w, step)?;
        summary.add_image("kernel_map_pred", &plane(prob, 0, 0)?, h, w, step)?;
    }
    summary.add_scalar("loss", metrics.loss, step)?;
    summary.add_scalar("c_loss", metrics.c_loss, step)?;
    summary.add_scalar("kernel_loss", metrics.kernel_loss, step)?;
    summary.add_scalar("pixel_accuracy", metrics.pixel_acc, step)?;
    Ok(())
}

fn epoch_progress(epoch: usize, num_batches: usize) -> ProgressBar {
    let pb = ProgressBar::new(num_batches as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_message(format!("epoch {epoch}"));
    pb
}

/// Run the full training procedure.
///
/// # Arguments
/// - `config`: hyperparameters, model shape and parameter-group policy
/// - `dataset`: sample source; its kernel count must match `config.model.num_kernels`
/// - `pretrained`: optional parameter file overlaid before re-initialisation
/// - `devices`: batch shards go to these devices in order; the first holds the model
/// - `span`: parent span for every event the run emits
///
/// Writes `config.json`, `events.jsonl`, `images/` and one `model_<epoch>.param`
/// per epoch into `config.checkpoint_dir`. Any error aborts the run.
pub fn train<B: AutodiffBackend, S: SampleSource>(
    config: &TrainingConfig,
    dataset: S,
    pretrained: Option<&Path>,
    devices: &DeviceSet<B>,
    span: tracing::Span,
) -> anyhow::Result<(PseNet<B>, TrainReport)> {
    let _entered = span.enter();
    anyhow::ensure!(config.batch_size > 0, "batch size must be positive");
    anyhow::ensure!(!dataset.is_empty(), "dataset is empty");

    let ckpt = PathBuf::from(&config.checkpoint_dir);
    std::fs::create_dir_all(&ckpt)
        .with_context(|| format!("Failed to create checkpoint directory {}", ckpt.display()))?;
    config
        .save(ckpt.join(CONFIG_FILE))
        .with_context(|| format!("Failed to write {CONFIG_FILE} in {}", ckpt.display()))?;

    B::seed(config.seed);
    let (mut model, pretrained_report) = prepare_model::<B>(config, pretrained, devices.primary())?;

    let dataset_len = dataset.len();
    let global_batch = config.global_batch(devices.len());
    let mut loader = DataLoader::new(dataset, global_batch)
        .with_seed(config.seed)
        .with_drop_last(devices.len() > 1);
    let num_batches = loader.num_batches();
    anyhow::ensure!(
        num_batches > 0,
        "dataset of {dataset_len} samples yields no full batch of {global_batch}"
    );

    let schedule = PolySchedule::new(config.lr, PolySchedule::budget(dataset_len, config.epochs, global_batch))
        .with_power(config.lr_power);
    let mut optim = SgdConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(config.momentum)
                .with_dampening(0.0),
        ))
        .init::<B, PseNet<B>>();
    let loss_fn = DiceLossWithOhem::new()
        .with_lam(config.lam)
        .with_ohem_ratio(config.ohem_ratio);
    let trainable = config.param_groups.trainable();
    let mut summary = SummaryWriter::create(&ckpt)?;

    tracing::info!(
        dataset_len,
        devices = devices.len(),
        global_batch,
        num_batches,
        max_update = schedule.max_update,
        params = model.num_params(),
        trainable = ?trainable,
        "Starting training"
    );

    let mut report = TrainReport {
        max_update: schedule.max_update,
        pretrained: pretrained_report,
        ..Default::default()
    };
    let train_start = Instant::now();

    for epoch in 0..config.epochs {
        let epoch_span = tracing::info_span!("epoch", epoch);
        let _epoch_entered = epoch_span.enter();
        let mut running = RunningLoss::new();
        let pb = epoch_progress(epoch, num_batches);

        for (batch_idx, batch) in loader.epoch().enumerate() {
            let shards = batch?.split(devices.len())?;
            let lr = schedule.lr(report.updates);

            let mut step = ReplicaStep::new(&model, devices, &loss_fn, global_batch, &trainable);
            let loss = forward_then_backward(&mut step, shards)?;
            let (grads, snapshot) = step.finish()?;
            for (group, group_grads) in grads {
                let group_lr = lr * config.param_groups.get(group).lr_mult;
                model = optim.step(group_lr, model, group_grads);
            }
            report.updates += 1;
            report.learning_rates.push(lr);

            let metrics = BatchMetrics {
                loss,
                c_loss: snapshot.c_loss,
                kernel_loss: snapshot.kernel_loss,
                pixel_acc: snapshot.pixel_acc,
                kernel_acc: snapshot.kernel_acc,
            };
            tracing::info!(
                step = batch_idx * global_batch,
                loss = metrics.loss,
                score_loss = metrics.c_loss,
                kernel_loss = metrics.kernel_loss,
                pixel_acc = metrics.pixel_acc,
                kernel_acc = metrics.kernel_acc,
                lr = %format!("{lr:.2e}"),
                "batch"
            );
            let warnings = metrics.health_check();
            if !warnings.is_empty() {
                tracing::warn!(batch_idx, "Health check warnings: {:?}", warnings);
            }

            if config.verbose_step > 0 && batch_idx % config.verbose_step == 0 {
                let gs = global_step(dataset_len, epoch, batch_idx, global_batch);
                write_summary(&mut summary, &metrics, &snapshot, gs)?;
            }
            running.update(loss);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let mean_loss = running.mean().unwrap_or(f64::NAN);
        tracing::info!(epoch, mean_loss, batches = running.count(), "Epoch finished");

        let path = ckpt.join(format!("model_{epoch}.param"));
        save_checkpoint(&model, &path)?;
        summary.flush()?;
        tracing::info!(path = %path.display(), "Checkpoint saved");

        report.epoch_losses.push(mean_loss);
        report.checkpoints.push(path);
        report.epochs += 1;
    }

    tracing::info!(
        epochs = report.epochs,
        updates = report.updates,
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training complete"
    );
    Ok((model, report))
}
