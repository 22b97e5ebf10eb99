use burn::prelude::*;

use crate::model::backbone::{Backbone, BackboneConfig};
use crate::model::decoder::{Decoder, DecoderConfig, ExtraHead, ExtraHeadConfig};
use crate::model::params::{reinit_conv, ParamGroup, ParamGroups, WeightInit};

/// Output stride of the prediction maps relative to the input image.
pub const OUTPUT_STRIDE: usize = 4;

/// Configuration for the full PSENet.
///
/// ```text
/// (batch, 3, H, W)
///   → resnet  → [C2, C3, C4, C5]
///   → decoder → (batch, 4 * fpn_channels, H/4, W/4)
///   → extra   → (batch, num_kernels, H/4, W/4) logits
/// ```
///
/// Channels `0..num_kernels-1` are the shrunk kernels (largest first) and the
/// last channel is the full text map.
#[derive(Config, Debug)]
pub struct PseNetConfig {
    #[config(default = 3)]
    pub num_kernels: usize,
    #[config(default = 64)]
    pub backbone_width: usize,
    #[config(default = "[2, 2, 2, 2]")]
    pub blocks_per_stage: [usize; 4],
    #[config(default = 256)]
    pub fpn_channels: usize,
}

impl PseNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PseNet<B> {
        let backbone = BackboneConfig::new()
            .with_width(self.backbone_width)
            .with_blocks_per_stage(self.blocks_per_stage);
        let decoder = DecoderConfig::new(backbone.stage_channels()).with_fpn_channels(self.fpn_channels);
        let extra = ExtraHeadConfig::new(decoder.out_channels())
            .with_hidden_channels(self.fpn_channels)
            .with_num_kernels(self.num_kernels);
        PseNet {
            resnet: backbone.init(device),
            decoder: decoder.init(device),
            extra: extra.init(device),
        }
    }
}

/// Progressive-scale text detector: ResNet features, FPN fusion, kernel head.
#[derive(Module, Debug)]
pub struct PseNet<B: Backend> {
    pub resnet: Backbone<B>,
    pub decoder: Decoder<B>,
    pub extra: ExtraHead<B>,
}

impl<B: Backend> PseNet<B> {
    /// Images `(batch, 3, H, W)` → logits `(batch, num_kernels, ⌈H/4⌉, ⌈W/4⌉)`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = self.resnet.forward(images);
        let fused = self.decoder.forward(features);
        self.extra.forward(fused)
    }

    /// Number of scalar parameters in `group`.
    pub fn group_params(&self, group: ParamGroup) -> usize {
        match group {
            ParamGroup::Backbone => self.resnet.num_params(),
            ParamGroup::Decoder => self.decoder.num_params(),
            ParamGroup::Extra => self.extra.num_params(),
        }
    }

    /// Convolution kernels of `group`, in construction order.
    pub fn conv_weights(&self, group: ParamGroup) -> Vec<Tensor<B, 4>> {
        match group {
            ParamGroup::Backbone => self.resnet.conv_weights(),
            ParamGroup::Decoder => self.decoder.conv_weights(),
            ParamGroup::Extra => self.extra.conv_weights(),
        }
    }

    /// Replace the convolution weights of `group` with fresh values from `init`
    /// and zero their biases. Normalisation layers are left alone.
    ///
    /// The backbone has no re-initialisation path; it is either pretrained or
    /// keeps its construction-time weights.
    pub fn reinit_group(mut self, group: ParamGroup, init: WeightInit, device: &B::Device) -> Self {
        match group {
            ParamGroup::Backbone => {
                tracing::warn!("Ignoring re-initialisation request for the backbone group");
            }
            ParamGroup::Decoder => {
                let d = self.decoder;
                self.decoder = Decoder {
                    laterals: d.laterals.into_iter().map(|c| reinit_conv(c, init, device)).collect(),
                    smooth: d.smooth.into_iter().map(|c| reinit_conv(c, init, device)).collect(),
                };
            }
            ParamGroup::Extra => {
                let mut e = self.extra;
                e.conv = reinit_conv(e.conv, init, device);
                e.out = reinit_conv(e.out, init, device);
                self.extra = e;
            }
        }
        self
    }

    /// Apply every configured re-initialisation.
    pub fn reinit_groups(self, groups: &ParamGroups, device: &B::Device) -> Self {
        ParamGroup::ALL.into_iter().fold(self, |model, group| match groups.get(group).reinit {
            Some(init) => {
                tracing::info!(%group, ?init, "Re-initialising parameter group");
                model.reinit_group(group, init, device)
            }
            None => model,
        })
    }

    /// Disable gradients for every group configured as not trainable.
    pub fn freeze_groups(mut self, groups: &ParamGroups) -> Self {
        if !groups.backbone.trainable {
            self.resnet = self.resnet.no_grad();
        }
        if !groups.decoder.trainable {
            self.decoder = self.decoder.no_grad();
        }
        if !groups.extra.trainable {
            self.extra = self.extra.no_grad();
        }
        let frozen: Vec<String> = ParamGroup::ALL
            .into_iter()
            .filter(|g| !groups.get(*g).trainable)
            .map(|g| g.to_string())
            .collect();
        tracing::info!(frozen = ?frozen, "Froze parameter groups");
        self
    }
}
