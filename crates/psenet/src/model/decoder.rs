//! Feature-pyramid decoder and the kernel prediction head.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Nearest-neighbour upsampling to `size = [height, width]`.
///
/// Repeats each pixel by the rounded-up integer factor and crops the excess,
/// so odd pyramid levels still line up with the finer level.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    if [h, w] == size {
        return x;
    }
    let fy = size[0].div_ceil(h).max(1);
    let fx = size[1].div_ceil(w).max(1);
    x.reshape([b, c, h, 1, w, 1])
        .repeat_dim(3, fy)
        .repeat_dim(5, fx)
        .reshape([b, c, h * fy, w * fx])
        .slice([0..b, 0..c, 0..size[0], 0..size[1]])
}

#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Channels of C2..C5 coming out of the backbone.
    pub in_channels: [usize; 4],
    #[config(default = 256)]
    pub fpn_channels: usize,
}

impl DecoderConfig {
    pub fn out_channels(&self) -> usize {
        4 * self.fpn_channels
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let laterals = self
            .in_channels
            .iter()
            .map(|&c| Conv2dConfig::new([c, self.fpn_channels], [1, 1]).init(device))
            .collect();
        let smooth = (0..3)
            .map(|_| {
                Conv2dConfig::new([self.fpn_channels, self.fpn_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();
        Decoder { laterals, smooth }
    }
}

/// FPN top-down pathway; every level is brought back to stride 4 and concatenated.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    /// 1x1 projections of C2..C5.
    pub(crate) laterals: Vec<Conv2d<B>>,
    /// 3x3 smoothing of the merged P2..P4.
    pub(crate) smooth: Vec<Conv2d<B>>,
}

impl<B: Backend> Decoder<B> {
    pub fn conv_weights(&self) -> Vec<Tensor<B, 4>> {
        self.laterals
            .iter()
            .chain(&self.smooth)
            .map(|c| c.weight.val())
            .collect()
    }

    /// `features` is `[C2, C3, C4, C5]`; output is `(batch, 4 * fpn, H/4, W/4)`.
    pub fn forward(&self, features: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let lateral: Vec<Tensor<B, 4>> = features
            .into_iter()
            .zip(&self.laterals)
            .map(|(f, conv)| conv.forward(f))
            .collect();

        // Top-down: P5 = L5, P_i = L_i + up(P_{i+1}).
        let mut merged = Vec::with_capacity(lateral.len());
        let mut above: Option<Tensor<B, 4>> = None;
        for l in lateral.into_iter().rev() {
            let p = match above {
                Some(prev) => {
                    let [_, _, h, w] = l.dims();
                    l + upsample_nearest(prev, [h, w])
                }
                None => l,
            };
            above = Some(p.clone());
            merged.push(p);
        }
        merged.reverse();

        let [_, _, h, w] = merged[0].dims();
        let levels: Vec<Tensor<B, 4>> = merged
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let p = match self.smooth.get(i) {
                    Some(conv) => conv.forward(p),
                    None => p,
                };
                upsample_nearest(p, [h, w])
            })
            .collect();
        Tensor::cat(levels, 1)
    }
}

#[derive(Config, Debug)]
pub struct ExtraHeadConfig {
    pub in_channels: usize,
    #[config(default = 256)]
    pub hidden_channels: usize,
    /// Output maps: `num_kernels - 1` shrunk kernels followed by the full text map.
    #[config(default = 3)]
    pub num_kernels: usize,
}

impl ExtraHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ExtraHead<B> {
        ExtraHead {
            conv: Conv2dConfig::new([self.in_channels, self.hidden_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            bn: BatchNormConfig::new(self.hidden_channels).init(device),
            out: Conv2dConfig::new([self.hidden_channels, self.num_kernels], [1, 1]).init(device),
        }
    }
}

/// Fused features → per-kernel logits.
#[derive(Module, Debug)]
pub struct ExtraHead<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) bn: BatchNorm<B, 2>,
    pub(crate) out: Conv2d<B>,
}

impl<B: Backend> ExtraHead<B> {
    pub fn conv_weights(&self) -> Vec<Tensor<B, 4>> {
        vec![self.conv.weight.val(), self.out.weight.val()]
    }

    pub fn forward(&self, fused: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn.forward(self.conv.forward(fused)));
        self.out.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_upsample_nearest_repeats_pixels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 1, 2, 2]),
            &device,
        );
        let up = upsample_nearest(x, [4, 4]);
        let values = up.into_data().to_vec::<f32>().unwrap();
        assert_eq!(
            values,
            vec![
                1.0, 1.0, 2.0, 2.0, //
                1.0, 1.0, 2.0, 2.0, //
                3.0, 3.0, 4.0, 4.0, //
                3.0, 3.0, 4.0, 4.0,
            ]
        );
    }

    #[test]
    fn test_upsample_crops_to_odd_size() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 5, 3], &device);
        assert_eq!(upsample_nearest(x, [9, 5]).dims(), [2, 3, 9, 5]);
    }

    #[test]
    fn test_decoder_fuses_to_finest_level() {
        let device = Default::default();
        let decoder = DecoderConfig::new([4, 8, 16, 32])
            .with_fpn_channels(6)
            .init::<TestBackend>(&device);
        let feats = vec![
            Tensor::<TestBackend, 4>::random([2, 4, 16, 16], Distribution::Default, &device),
            Tensor::random([2, 8, 8, 8], Distribution::Default, &device),
            Tensor::random([2, 16, 4, 4], Distribution::Default, &device),
            Tensor::random([2, 32, 2, 2], Distribution::Default, &device),
        ];
        assert_eq!(decoder.forward(feats).dims(), [2, 24, 16, 16]);
    }

    #[test]
    fn test_extra_head_emits_one_map_per_kernel() {
        let device = Default::default();
        let head = ExtraHeadConfig::new(24)
            .with_hidden_channels(8)
            .with_num_kernels(5)
            .init::<TestBackend>(&device);
        let fused = Tensor::<TestBackend, 4>::random([1, 24, 8, 8], Distribution::Default, &device);
        assert_eq!(head.forward(fused).dims(), [1, 5, 8, 8]);
    }
}
