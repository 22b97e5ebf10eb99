//! TOML config loading for the training CLI.
//!
//! Deserializes `configs/train.toml`, which has `[train]`, `[model]`, `[data]`
//! and `[param_groups.*]` sections, then merges CLI overrides on top.

use std::path::Path;

use anyhow::Context;
use icdar::DatasetConfig;
use psenet::model::ParamGroupConfig;
use psenet::TrainingConfig;
use serde::Deserialize;

/// Top-level structure matching `configs/train.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct TrainToml {
    #[serde(default)]
    pub train: TrainOverrides,
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub data: DataOverrides,
    #[serde(default)]
    pub param_groups: GroupOverrides,
}

/// Optimisation and bookkeeping fields of `TrainingConfig`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TrainOverrides {
    pub epochs: Option<usize>,
    pub lr: Option<f64>,
    pub weight_decay: Option<f64>,
    pub momentum: Option<f64>,
    pub batch_size: Option<usize>,
    pub verbose_step: Option<usize>,
    pub checkpoint_dir: Option<String>,
    pub lam: Option<f64>,
    pub ohem_ratio: Option<f64>,
    pub lr_power: Option<f64>,
    pub seed: Option<u64>,
}

/// Network shape.
#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    pub num_kernels: Option<usize>,
    pub backbone_width: Option<usize>,
    pub blocks_per_stage: Option<[usize; 4]>,
    pub fpn_channels: Option<usize>,
}

/// Sample preparation. The kernel count always follows the model.
#[derive(Debug, Default, Deserialize)]
pub struct DataOverrides {
    pub input_size: Option<usize>,
    pub min_scale: Option<f32>,
    pub augment: Option<bool>,
}

/// Whole-group replacements; a group left out keeps its default policy.
#[derive(Debug, Default, Deserialize)]
pub struct GroupOverrides {
    pub backbone: Option<ParamGroupConfig>,
    pub decoder: Option<ParamGroupConfig>,
    pub extra: Option<ParamGroupConfig>,
}

/// Load and deserialize a `TrainToml` from a TOML file.
pub fn load_train_toml(path: &Path) -> anyhow::Result<TrainToml> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: TrainToml =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded training config");
    Ok(config)
}

/// Build the training configuration.
///
/// Priority chain: `TrainingConfig::new()` defaults < TOML values < CLI flags.
pub fn build_training_config(toml: &TrainToml, cli: &TrainOverrides) -> TrainingConfig {
    let mut config = TrainingConfig::new();

    for o in [&toml.train, cli] {
        if let Some(v) = o.epochs {
            config.epochs = v;
        }
        if let Some(v) = o.lr {
            config.lr = v;
        }
        if let Some(v) = o.weight_decay {
            config.weight_decay = v;
        }
        if let Some(v) = o.momentum {
            config.momentum = v;
        }
        if let Some(v) = o.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = o.verbose_step {
            config.verbose_step = v;
        }
        if let Some(v) = &o.checkpoint_dir {
            config.checkpoint_dir = v.clone();
        }
        if let Some(v) = o.lam {
            config.lam = v;
        }
        if let Some(v) = o.ohem_ratio {
            config.ohem_ratio = v;
        }
        if let Some(v) = o.lr_power {
            config.lr_power = v;
        }
        if let Some(v) = o.seed {
            config.seed = v;
        }
    }

    let m = &toml.model;
    if let Some(v) = m.num_kernels {
        config.model.num_kernels = v;
    }
    if let Some(v) = m.backbone_width {
        config.model.backbone_width = v;
    }
    if let Some(v) = m.blocks_per_stage {
        config.model.blocks_per_stage = v;
    }
    if let Some(v) = m.fpn_channels {
        config.model.fpn_channels = v;
    }

    let g = &toml.param_groups;
    if let Some(v) = &g.backbone {
        config.param_groups.backbone = v.clone();
    }
    if let Some(v) = &g.decoder {
        config.param_groups.decoder = v.clone();
    }
    if let Some(v) = &g.extra {
        config.param_groups.extra = v.clone();
    }

    config
}

/// Dataset settings matching the network's kernel count.
pub fn build_dataset_config(overrides: &DataOverrides, num_kernels: usize, augment_cli: bool) -> DatasetConfig {
    let mut config = DatasetConfig {
        num_kernels,
        ..Default::default()
    };
    if let Some(v) = overrides.input_size {
        config.input_size = v;
    }
    if let Some(v) = overrides.min_scale {
        config.min_scale = v;
    }
    if let Some(v) = overrides.augment {
        config.augment = v;
    }
    if augment_cli {
        config.augment = true;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use psenet::model::WeightInit;

    #[test]
    fn test_deserialize_full_train_toml() {
        let toml_str = r#"
[train]
epochs = 10
lr = 0.01
batch_size = 8
checkpoint_dir = "runs/a"

[model]
num_kernels = 6
backbone_width = 32
blocks_per_stage = [1, 1, 1, 1]

[data]
input_size = 320
min_scale = 0.5
augment = true

[param_groups.backbone]
trainable = true
lr_mult = 0.1

[param_groups.decoder]
reinit = "kaiming_normal"
"#;
        let toml: TrainToml = toml::from_str(toml_str).unwrap();
        assert_eq!(toml.train.epochs, Some(10));
        assert_eq!(toml.model.blocks_per_stage, Some([1, 1, 1, 1]));
        assert_eq!(toml.data.input_size, Some(320));

        let config = build_training_config(&toml, &TrainOverrides::default());
        assert_eq!(config.epochs, 10);
        assert_eq!(config.lr, 0.01);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.checkpoint_dir, "runs/a");
        assert_eq!(config.model.num_kernels, 6);
        assert_eq!(config.model.backbone_width, 32);
        // untouched fields keep their defaults
        assert_eq!(config.momentum, 0.9);
        assert_eq!(config.model.fpn_channels, 256);

        assert!(config.param_groups.backbone.trainable);
        assert_eq!(config.param_groups.backbone.reinit, None);
        assert_eq!(config.param_groups.backbone.lr_mult, 0.1);
        assert_eq!(config.param_groups.decoder.reinit, Some(WeightInit::KaimingNormal));
        assert_eq!(config.param_groups.decoder.lr_mult, 1.0);
        assert_eq!(config.param_groups.extra.reinit, Some(WeightInit::XavierUniform));

        let data = build_dataset_config(&toml.data, config.model.num_kernels, false);
        assert_eq!(data.num_kernels, 6);
        assert_eq!(data.input_size, 320);
        assert!(data.augment);
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let toml: TrainToml = toml::from_str("").unwrap();
        let config = build_training_config(&toml, &TrainOverrides::default());
        assert_eq!(config.epochs, 50);
        assert_eq!(config.batch_size, 4);
        assert!(!config.param_groups.backbone.trainable);

        let data = build_dataset_config(&toml.data, 3, false);
        assert_eq!(data.input_size, 640);
        assert!(!data.augment);
    }

    #[test]
    fn test_cli_override_priority() {
        let toml: TrainToml = toml::from_str("[train]\nepochs = 10\nlr = 0.01\n").unwrap();
        let cli = TrainOverrides {
            epochs: Some(2),
            seed: Some(7),
            ..Default::default()
        };
        let config = build_training_config(&toml, &cli);
        assert_eq!(config.epochs, 2);
        assert_eq!(config.lr, 0.01);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_train_toml(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/train.toml");
        let toml = load_train_toml(&path).unwrap();
        let config = build_training_config(&toml, &TrainOverrides::default());
        assert_eq!(config.model.num_kernels, 3);
    }
}
