//! Parameter groups: which part of the network is re-initialised, trained,
//! and at what learning-rate multiplier.

use std::fmt;

use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::nn::Initializer;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// The three named parts of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    Backbone,
    Decoder,
    Extra,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 3] = [ParamGroup::Backbone, ParamGroup::Decoder, ParamGroup::Extra];
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamGroup::Backbone => write!(f, "backbone"),
            ParamGroup::Decoder => write!(f, "decoder"),
            ParamGroup::Extra => write!(f, "extra"),
        }
    }
}

/// Variance-scaling strategies for convolution weights. Biases are always zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    XavierUniform,
    XavierNormal,
    KaimingUniform,
    KaimingNormal,
}

impl WeightInit {
    pub fn initializer(self) -> Initializer {
        match self {
            WeightInit::XavierUniform => Initializer::XavierUniform { gain: 1.0 },
            WeightInit::XavierNormal => Initializer::XavierNormal { gain: 1.0 },
            WeightInit::KaimingUniform => Initializer::KaimingUniform {
                gain: 2f64.sqrt(),
                fan_out_only: false,
            },
            WeightInit::KaimingNormal => Initializer::KaimingNormal {
                gain: 2f64.sqrt(),
                fan_out_only: false,
            },
        }
    }
}

/// Policy for one parameter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroupConfig {
    /// Overwrite the group's weights after the pretrained load.
    #[serde(default)]
    pub reinit: Option<WeightInit>,
    #[serde(default = "default_trainable")]
    pub trainable: bool,
    /// Multiplier applied to the scheduled learning rate for this group.
    #[serde(default = "default_lr_mult")]
    pub lr_mult: f64,
}

fn default_trainable() -> bool {
    true
}
fn default_lr_mult() -> f64 {
    1.0
}

impl ParamGroupConfig {
    pub fn head() -> Self {
        Self {
            reinit: Some(WeightInit::XavierUniform),
            trainable: true,
            lr_mult: 1.0,
        }
    }
}

/// Per-group policies for the whole network.
///
/// The default keeps the pretrained backbone frozen (its multiplier is raised
/// but has no effect while frozen) and re-initialises and trains the head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroups {
    pub backbone: ParamGroupConfig,
    pub decoder: ParamGroupConfig,
    pub extra: ParamGroupConfig,
}

impl Default for ParamGroups {
    fn default() -> Self {
        Self {
            backbone: ParamGroupConfig {
                reinit: None,
                trainable: false,
                lr_mult: 10.0,
            },
            decoder: ParamGroupConfig::head(),
            extra: ParamGroupConfig::head(),
        }
    }
}

impl ParamGroups {
    pub fn get(&self, group: ParamGroup) -> &ParamGroupConfig {
        match group {
            ParamGroup::Backbone => &self.backbone,
            ParamGroup::Decoder => &self.decoder,
            ParamGroup::Extra => &self.extra,
        }
    }

    /// Groups whose parameters receive gradients and optimizer updates.
    pub fn trainable(&self) -> Vec<ParamGroup> {
        ParamGroup::ALL
            .into_iter()
            .filter(|g| self.get(*g).trainable)
            .collect()
    }
}

/// Fresh weights for a convolution using `init`; bias (if any) set to zero.
pub(crate) fn reinit_conv<B: Backend>(mut conv: Conv2d<B>, init: WeightInit, device: &B::Device) -> Conv2d<B> {
    let [out, cin, kh, kw] = conv.weight.val().dims();
    let receptive = kh * kw;
    conv.weight = init
        .initializer()
        .init_with([out, cin, kh, kw], Some(cin * receptive), Some(out * receptive), device);
    conv.bias = conv
        .bias
        .as_ref()
        .map(|_| Param::from_tensor(Tensor::zeros([out], device)));
    conv
}
