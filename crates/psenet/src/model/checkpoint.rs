//! Parameter files: per-epoch checkpoints and partial pretrained loading.
//!
//! Files are named MessagePack records written through the bytes recorder so
//! the caller controls the exact file name (`model_<epoch>.param`).

use std::path::Path;

use anyhow::Context;
use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::nn::BatchNorm;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder};

use crate::model::backbone::{Backbone, BasicBlock, Stage};
use crate::model::decoder::{Decoder, ExtraHead};
use crate::model::params::ParamGroup;
use crate::model::psenet::{PseNet, PseNetConfig, PseNetRecord};

type ParamRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// What a pretrained file supplied.
///
/// Layer paths follow the module tree, e.g. `resnet.stages.0.blocks.1.conv1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PretrainedReport {
    /// Groups present in the file.
    pub loaded: Vec<ParamGroup>,
    /// Groups absent from the file.
    pub missing: Vec<ParamGroup>,
    /// Layers of loaded groups that kept their current values, either
    /// because the file lacks them or because a stored shape differs.
    pub kept: Vec<String>,
    /// Stored layers with no counterpart in the model.
    pub ignored: Vec<String>,
}

// Mirrors of the module records in which every entry may be absent, so a
// file from a differently shaped network still deserialises. Fields the
// model does not know about are dropped.

#[derive(Record)]
struct StoredConv<B: Backend> {
    weight: Option<Param<Tensor<B, 4>>>,
    bias: Option<Param<Tensor<B, 1>>>,
}

#[derive(Record)]
struct StoredNorm<B: Backend> {
    gamma: Option<Param<Tensor<B, 1>>>,
    beta: Option<Param<Tensor<B, 1>>>,
    running_mean: Option<Param<Tensor<B, 1>>>,
    running_var: Option<Param<Tensor<B, 1>>>,
}

#[derive(Record)]
struct StoredProjection<B: Backend> {
    conv: Option<StoredConv<B>>,
    bn: Option<StoredNorm<B>>,
}

#[derive(Record)]
struct StoredBlock<B: Backend> {
    conv1: Option<StoredConv<B>>,
    bn1: Option<StoredNorm<B>>,
    conv2: Option<StoredConv<B>>,
    bn2: Option<StoredNorm<B>>,
    shortcut: Option<StoredProjection<B>>,
}

#[derive(Record)]
struct StoredStage<B: Backend> {
    blocks: Option<Vec<StoredBlock<B>>>,
}

#[derive(Record)]
struct StoredBackbone<B: Backend> {
    stem_conv: Option<StoredConv<B>>,
    stem_bn: Option<StoredNorm<B>>,
    stages: Option<Vec<StoredStage<B>>>,
}

#[derive(Record)]
struct StoredDecoder<B: Backend> {
    laterals: Option<Vec<StoredConv<B>>>,
    smooth: Option<Vec<StoredConv<B>>>,
}

#[derive(Record)]
struct StoredExtraHead<B: Backend> {
    conv: Option<StoredConv<B>>,
    bn: Option<StoredNorm<B>>,
    out: Option<StoredConv<B>>,
}

#[derive(Record)]
struct StoredPseNet<B: Backend> {
    resnet: Option<StoredBackbone<B>>,
    decoder: Option<StoredDecoder<B>>,
    extra: Option<StoredExtraHead<B>>,
}

/// Write all parameters of `model` to `path`.
pub fn save_checkpoint<B: Backend>(model: &PseNet<B>, path: &Path) -> anyhow::Result<()> {
    let bytes = ParamRecorder::new()
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("Failed to serialise parameters for {}: {e}", path.display()))?;
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Build a model from `config` and load every parameter from `path`.
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    config: &PseNetConfig,
    device: &B::Device,
) -> anyhow::Result<PseNet<B>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let record: PseNetRecord<B> = ParamRecorder::new()
        .load(bytes, device)
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", path.display()))?;
    Ok(config.init::<B>(device).load_record(record))
}

/// Overlay whatever `path` holds onto `model`, layer by layer.
///
/// A stored layer replaces the current one only when every tensor in it has
/// the model's shape. Layers the file lacks, or whose shapes differ, keep
/// their current values and are listed in [`PretrainedReport::kept`].
pub fn load_pretrained<B: Backend>(
    model: PseNet<B>,
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<(PseNet<B>, PretrainedReport)> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let record: StoredPseNet<B> = ParamRecorder::new()
        .load(bytes, device)
        .map_err(|e| anyhow::anyhow!("Failed to load pretrained weights from {}: {e}", path.display()))?;

    let mut overlay = Overlay::default();
    let PseNet { resnet, decoder, extra } = model;

    let resnet = match record.resnet {
        Some(stored) => {
            overlay.report.loaded.push(ParamGroup::Backbone);
            overlay.backbone(resnet, stored)
        }
        None => {
            overlay.report.missing.push(ParamGroup::Backbone);
            resnet
        }
    };
    let decoder = match record.decoder {
        Some(stored) => {
            overlay.report.loaded.push(ParamGroup::Decoder);
            overlay.decoder(decoder, stored)
        }
        None => {
            overlay.report.missing.push(ParamGroup::Decoder);
            decoder
        }
    };
    let extra = match record.extra {
        Some(stored) => {
            overlay.report.loaded.push(ParamGroup::Extra);
            overlay.extra(extra, stored)
        }
        None => {
            overlay.report.missing.push(ParamGroup::Extra);
            extra
        }
    };

    let report = overlay.report;
    if !report.kept.is_empty() {
        tracing::warn!(layers = ?report.kept, "Pretrained file does not fit these layers, keeping current values");
    }
    tracing::info!(
        path = %path.display(),
        loaded = ?report.loaded,
        missing = ?report.missing,
        kept = report.kept.len(),
        ignored = report.ignored.len(),
        "Loaded pretrained weights"
    );
    Ok((PseNet { resnet, decoder, extra }, report))
}

#[derive(Default)]
struct Overlay {
    report: PretrainedReport,
}

impl Overlay {
    fn keep(&mut self, path: String) {
        tracing::debug!(layer = %path, "Keeping current values");
        self.report.kept.push(path);
    }

    fn conv<B: Backend>(&mut self, mut current: Conv2d<B>, stored: Option<StoredConv<B>>, path: String) -> Conv2d<B> {
        let Some(StoredConv { weight: Some(weight), bias }) = stored else {
            self.keep(path);
            return current;
        };
        let bias_fits = match (&current.bias, &bias) {
            (Some(c), Some(s)) => c.val().dims() == s.val().dims(),
            (None, None) => true,
            _ => false,
        };
        if weight.val().dims() != current.weight.val().dims() || !bias_fits {
            self.keep(path);
            return current;
        }
        current.weight = current.weight.load_record(weight);
        current.bias = match (current.bias, bias) {
            (Some(c), Some(s)) => Some(c.load_record(s)),
            (c, _) => c,
        };
        current
    }

    fn norm<B: Backend>(
        &mut self,
        mut current: BatchNorm<B, 2>,
        stored: Option<StoredNorm<B>>,
        path: String,
    ) -> BatchNorm<B, 2> {
        let Some(StoredNorm {
            gamma: Some(gamma),
            beta: Some(beta),
            running_mean: Some(mean),
            running_var: Some(var),
        }) = stored
        else {
            self.keep(path);
            return current;
        };
        let dims = current.gamma.val().dims();
        if [&gamma, &beta, &mean, &var].iter().any(|p| p.val().dims() != dims) {
            self.keep(path);
            return current;
        }
        current.gamma = current.gamma.load_record(gamma);
        current.beta = current.beta.load_record(beta);
        current.running_mean = current.running_mean.load_record(mean);
        current.running_var = current.running_var.load_record(var);
        current
    }

    /// Pair `current` with `stored` by index. Unmatched current items are
    /// kept whole; unmatched stored items are ignored.
    fn each<T, S>(
        &mut self,
        current: Vec<T>,
        stored: Option<Vec<S>>,
        path: &str,
        merge: impl Fn(&mut Self, T, S, String) -> T,
    ) -> Vec<T> {
        let mut stored = stored.unwrap_or_default().into_iter();
        let mut merged = Vec::with_capacity(current.len());
        for (i, item) in current.into_iter().enumerate() {
            let item_path = format!("{path}.{i}");
            match stored.next() {
                Some(s) => merged.push(merge(self, item, s, item_path)),
                None => {
                    self.keep(item_path);
                    merged.push(item);
                }
            }
        }
        let offset = merged.len();
        for (i, _) in stored.enumerate() {
            self.report.ignored.push(format!("{path}.{}", offset + i));
        }
        merged
    }

    fn backbone<B: Backend>(&mut self, mut current: Backbone<B>, stored: StoredBackbone<B>) -> Backbone<B> {
        current.stem_conv = self.conv(current.stem_conv, stored.stem_conv, "resnet.stem_conv".into());
        current.stem_bn = self.norm(current.stem_bn, stored.stem_bn, "resnet.stem_bn".into());
        current.stages = self.each(current.stages, stored.stages, "resnet.stages", Self::stage);
        current
    }

    fn stage<B: Backend>(&mut self, mut current: Stage<B>, stored: StoredStage<B>, path: String) -> Stage<B> {
        current.blocks = self.each(current.blocks, stored.blocks, &format!("{path}.blocks"), Self::block);
        current
    }

    fn block<B: Backend>(&mut self, mut current: BasicBlock<B>, stored: StoredBlock<B>, path: String) -> BasicBlock<B> {
        current.conv1 = self.conv(current.conv1, stored.conv1, format!("{path}.conv1"));
        current.bn1 = self.norm(current.bn1, stored.bn1, format!("{path}.bn1"));
        current.conv2 = self.conv(current.conv2, stored.conv2, format!("{path}.conv2"));
        current.bn2 = self.norm(current.bn2, stored.bn2, format!("{path}.bn2"));
        current.shortcut = match (current.shortcut, stored.shortcut) {
            (Some(mut p), Some(s)) => {
                p.conv = self.conv(p.conv, s.conv, format!("{path}.shortcut.conv"));
                p.bn = self.norm(p.bn, s.bn, format!("{path}.shortcut.bn"));
                Some(p)
            }
            (Some(p), None) => {
                self.keep(format!("{path}.shortcut"));
                Some(p)
            }
            (None, Some(_)) => {
                self.report.ignored.push(format!("{path}.shortcut"));
                None
            }
            (None, None) => None,
        };
        current
    }

    fn decoder<B: Backend>(&mut self, mut current: Decoder<B>, stored: StoredDecoder<B>) -> Decoder<B> {
        let conv = |o: &mut Self, c: Conv2d<B>, s: StoredConv<B>, path: String| o.conv(c, Some(s), path);
        current.laterals = self.each(current.laterals, stored.laterals, "decoder.laterals", conv);
        current.smooth = self.each(current.smooth, stored.smooth, "decoder.smooth", conv);
        current
    }

    fn extra<B: Backend>(&mut self, mut current: ExtraHead<B>, stored: StoredExtraHead<B>) -> ExtraHead<B> {
        current.conv = self.conv(current.conv, stored.conv, "extra.conv".into());
        current.bn = self.norm(current.bn, stored.bn, "extra.bn".into());
        current.out = self.conv(current.out, stored.out, "extra.out".into());
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::backbone::BackboneConfig;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny() -> PseNetConfig {
        PseNetConfig::new()
            .with_backbone_width(4)
            .with_blocks_per_stage([1, 1, 1, 1])
            .with_fpn_channels(4)
    }

    fn max_abs_diff<const D: usize>(a: Tensor<TestBackend, D>, b: Tensor<TestBackend, D>) -> f32 {
        (a - b).abs().max().into_scalar().elem()
    }

    #[test]
    fn test_checkpoint_round_trip_uses_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = tiny().init::<TestBackend>(&device);
        let path = dir.path().join("model_0.param");
        save_checkpoint(&model, &path).unwrap();
        assert!(path.exists());

        let restored = load_checkpoint::<TestBackend>(&path, &tiny(), &device).unwrap();
        let d = max_abs_diff(model.extra.out.weight.val(), restored.extra.out.weight.val());
        assert_eq!(d, 0.0);
    }

    #[test]
    fn test_backbone_only_file_leaves_head_untouched() {
        #[derive(Module, Debug)]
        struct BackboneOnly<B: Backend> {
            resnet: crate::model::backbone::Backbone<B>,
        }

        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let source = BackboneOnly::<TestBackend> {
            resnet: BackboneConfig::new()
                .with_width(4)
                .with_blocks_per_stage([1, 1, 1, 1])
                .init(&device),
        };
        let path = dir.path().join("resnet.param");
        let bytes = ParamRecorder::new().record(source.clone().into_record(), ()).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let model = tiny().init::<TestBackend>(&device);
        let head_before = model.extra.out.weight.val();
        let (model, report) = load_pretrained(model, &path, &device).unwrap();

        assert_eq!(report.loaded, vec![ParamGroup::Backbone]);
        assert_eq!(report.missing, vec![ParamGroup::Decoder, ParamGroup::Extra]);
        assert!(report.kept.is_empty());
        assert!(report.ignored.is_empty());
        assert_eq!(max_abs_diff(head_before, model.extra.out.weight.val()), 0.0);

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let expected = source.resnet.forward(input.clone());
        let actual = model.resnet.forward(input);
        for (e, a) in expected.into_iter().zip(actual) {
            assert_eq!(max_abs_diff(e, a), 0.0);
        }
    }

    #[test]
    fn test_wrong_width_keeps_current_values() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let wide = tiny().with_backbone_width(8).init::<TestBackend>(&device);
        let path = dir.path().join("wide.param");
        save_checkpoint(&wide, &path).unwrap();

        let model = tiny().init::<TestBackend>(&device);
        let stem_before = model.resnet.stem_conv.weight.val();
        let (model, report) = load_pretrained(model, &path, &device).unwrap();

        assert_eq!(report.loaded, ParamGroup::ALL.to_vec());
        assert!(report.kept.contains(&"resnet.stem_conv".to_string()));
        assert!(report.kept.contains(&"decoder.laterals.0".to_string()));
        assert_eq!(max_abs_diff(stem_before, model.resnet.stem_conv.weight.val()), 0.0);
        // the head only sees fpn channels, so it still fits
        assert!(!report.kept.iter().any(|l| l.starts_with("extra")));
        assert_eq!(max_abs_diff(wide.extra.out.weight.val(), model.extra.out.weight.val()), 0.0);
        assert_eq!(max_abs_diff(wide.decoder.smooth[0].weight.val(), model.decoder.smooth[0].weight.val()), 0.0);
    }

    #[test]
    fn test_shallower_file_loads_shared_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let shallow = tiny().init::<TestBackend>(&device);
        let path = dir.path().join("shallow.param");
        save_checkpoint(&shallow, &path).unwrap();

        let model = tiny().with_blocks_per_stage([2, 1, 1, 1]).init::<TestBackend>(&device);
        let fresh = model.resnet.stages[0].blocks[1].clone();
        let (model, report) = load_pretrained(model, &path, &device).unwrap();

        assert_eq!(report.kept, vec!["resnet.stages.0.blocks.1".to_string()]);
        assert!(report.ignored.is_empty());

        let stage0 = &model.resnet.stages[0];
        let loaded = &stage0.blocks[0];
        let stored = &shallow.resnet.stages[0].blocks[0];
        assert_eq!(max_abs_diff(stored.conv1.weight.val(), loaded.conv1.weight.val()), 0.0);
        assert_eq!(max_abs_diff(stored.bn2.gamma.val(), loaded.bn2.gamma.val()), 0.0);
        assert_eq!(max_abs_diff(fresh.conv1.weight.val(), stage0.blocks[1].conv1.weight.val()), 0.0);
        assert_eq!(max_abs_diff(fresh.conv2.weight.val(), stage0.blocks[1].conv2.weight.val()), 0.0);

        // later stages line up one to one
        let stored = &shallow.resnet.stages[3].blocks[0];
        let loaded = &model.resnet.stages[3].blocks[0];
        assert_eq!(max_abs_diff(stored.conv2.weight.val(), loaded.conv2.weight.val()), 0.0);
        assert_eq!(max_abs_diff(shallow.extra.out.weight.val(), model.extra.out.weight.val()), 0.0);
    }

    #[test]
    fn test_deeper_file_ignores_surplus_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let deep = tiny().with_blocks_per_stage([2, 1, 1, 1]).init::<TestBackend>(&device);
        let path = dir.path().join("deep.param");
        save_checkpoint(&deep, &path).unwrap();

        let (model, report) = load_pretrained(tiny().init::<TestBackend>(&device), &path, &device).unwrap();
        assert!(report.kept.is_empty());
        assert_eq!(report.ignored, vec!["resnet.stages.0.blocks.1".to_string()]);
        assert_eq!(model.resnet.stages[0].blocks.len(), 1);
        assert_eq!(
            max_abs_diff(
                deep.resnet.stages[0].blocks[0].conv1.weight.val(),
                model.resnet.stages[0].blocks[0].conv1.weight.val()
            ),
            0.0
        );
    }
}
