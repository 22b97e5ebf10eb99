use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the ResNet-style feature extractor.
///
/// ```text
/// (batch, 3, H, W)
///   → conv7x7/2 → BN → ReLU → maxpool3x3/2        stride 4
///   → stage1 (w channels)                          C2, stride 4
///   → stage2 (2w channels, first block stride 2)   C3, stride 8
///   → stage3 (4w channels, first block stride 2)   C4, stride 16
///   → stage4 (8w channels, first block stride 2)   C5, stride 32
/// ```
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Channel count of the first stage; later stages double it.
    #[config(default = 64)]
    pub width: usize,
    /// Number of basic blocks in each of the four stages.
    #[config(default = "[2, 2, 2, 2]")]
    pub blocks_per_stage: [usize; 4],
}

impl BackboneConfig {
    /// Output channels of C2..C5.
    pub fn stage_channels(&self) -> [usize; 4] {
        let w = self.width;
        [w, 2 * w, 4 * w, 8 * w]
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let channels = self.stage_channels();
        let strides = [1, 2, 2, 2];

        let mut stages = Vec::with_capacity(4);
        let mut in_channels = self.width;
        for ((&out, &stride), &blocks) in channels.iter().zip(&strides).zip(&self.blocks_per_stage) {
            let mut stage = Vec::with_capacity(blocks.max(1));
            for b in 0..blocks.max(1) {
                let s = if b == 0 { stride } else { 1 };
                stage.push(BasicBlock::new(in_channels, out, s, device));
                in_channels = out;
            }
            stages.push(Stage { blocks: stage });
        }

        Backbone {
            stem_conv: Conv2dConfig::new([3, self.width], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            stem_bn: BatchNormConfig::new(self.width).init(device),
            stem_pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            stages,
        }
    }
}

fn affine<B: Backend>(bn: &BatchNorm<B, 2>) -> Vec<Tensor<B, 1>> {
    vec![bn.gamma.val(), bn.beta.val()]
}

/// Two 3x3 convolutions with an identity (or projected) shortcut.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub(crate) conv1: Conv2d<B>,
    pub(crate) bn1: BatchNorm<B, 2>,
    pub(crate) conv2: Conv2d<B>,
    pub(crate) bn2: BatchNorm<B, 2>,
    /// 1x1 projection, present when the block changes stride or width.
    pub(crate) shortcut: Option<Projection<B>>,
}

#[derive(Module, Debug)]
pub struct Projection<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) bn: BatchNorm<B, 2>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv3x3 = |cin: usize, s: usize| {
            Conv2dConfig::new([cin, out_channels], [3, 3])
                .with_stride([s, s])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device)
        };
        let shortcut = (stride != 1 || in_channels != out_channels).then(|| Projection {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });
        Self {
            conv1: conv3x3(in_channels, stride),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, 1),
            bn2: BatchNormConfig::new(out_channels).init(device),
            shortcut,
        }
    }

    fn conv_weights(&self) -> Vec<Tensor<B, 4>> {
        let mut w = vec![self.conv1.weight.val(), self.conv2.weight.val()];
        if let Some(p) = &self.shortcut {
            w.push(p.conv.weight.val());
        }
        w
    }

    fn norm_params(&self) -> Vec<Tensor<B, 1>> {
        let mut bns = vec![&self.bn1, &self.bn2];
        if let Some(p) = &self.shortcut {
            bns.push(&p.bn);
        }
        bns.into_iter().flat_map(affine).collect()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(p) => p.bn.forward(p.conv.forward(x.clone())),
            None => x.clone(),
        };
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        relu(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    pub(crate) blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

/// Feature extractor producing the C2..C5 pyramid.
///
/// This is the group that usually comes from a pretrained file and stays frozen.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub(crate) stem_conv: Conv2d<B>,
    pub(crate) stem_bn: BatchNorm<B, 2>,
    pub(crate) stem_pool: MaxPool2d,
    pub(crate) stages: Vec<Stage<B>>,
}

impl<B: Backend> Backbone<B> {
    /// Every convolution kernel, stem first.
    pub fn conv_weights(&self) -> Vec<Tensor<B, 4>> {
        let mut weights = vec![self.stem_conv.weight.val()];
        for stage in &self.stages {
            for block in &stage.blocks {
                weights.extend(block.conv_weights());
            }
        }
        weights
    }

    /// Scale and shift of every batch norm, stem first, `[gamma, beta]` per layer.
    pub fn norm_params(&self) -> Vec<Tensor<B, 1>> {
        let mut params = affine(&self.stem_bn);
        for stage in &self.stages {
            for block in &stage.blocks {
                params.extend(block.norm_params());
            }
        }
        params
    }

    /// Returns `[C2, C3, C4, C5]` at strides 4, 8, 16 and 32.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let x = relu(self.stem_bn.forward(self.stem_conv.forward(images)));
        let mut x = self.stem_pool.forward(x);
        let mut features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            x = stage.forward(x);
            features.push(x.clone());
        }
        features
    }
}
