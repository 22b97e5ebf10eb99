//! Dice loss with online hard example mining (OHEM) for PSENet.
//!
//! The text map is trained with a dice loss restricted to all positives plus
//! the hardest negatives (highest predicted score), at most `ohem_ratio`
//! negatives per positive. Kernel maps are trained with a dice loss restricted
//! to pixels the network currently believes are text.

use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::TensorData;
use icdar::TargetBatch;

use crate::model::bridge::{targets_to_tensors, tensor_to_vec};

/// Per-sample loss terms plus host-side accuracies for logging.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// `(batch,)`: `lam * c_loss + (1 - lam) * kernel_loss`.
    pub loss: Tensor<B, 1>,
    /// `(batch,)` OHEM-masked text dice loss.
    pub c_loss: Tensor<B, 1>,
    /// `(batch,)` kernel dice loss averaged over kernel maps.
    pub kernel_loss: Tensor<B, 1>,
    /// Fraction of training-mask pixels whose binarised text prediction matches GT.
    pub pixel_acc: f64,
    /// Fraction of (text pixel, kernel) pairs whose binarised kernel prediction matches GT.
    pub kernel_acc: f64,
}

/// Weighted text + kernel dice loss with hard negative mining.
#[derive(Config, Debug)]
pub struct DiceLossWithOhem {
    /// Weight of the text term; kernels get `1 - lam`.
    #[config(default = 0.7)]
    pub lam: f64,
    /// Negatives kept per positive pixel.
    #[config(default = 3.0)]
    pub ohem_ratio: f64,
    /// Added to both denominators of the dice ratio.
    #[config(default = 1e-3)]
    pub eps: f64,
}

impl DiceLossWithOhem {
    /// Compute the loss of `logits` `(batch, K, h, w)` against `targets` on the same grid.
    ///
    /// Channel `K - 1` of `logits` is the text map, channels `0..K-1` the kernels.
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: &TargetBatch) -> anyhow::Result<LossOutput<B>> {
        let [b, k, h, w] = logits.dims();
        anyhow::ensure!(
            [b, k, h, w] == [targets.batch_size, targets.num_kernel_maps + 1, targets.height, targets.width],
            "prediction shape {:?} does not match targets (batch {}, {} kernel maps, {}x{})",
            [b, k, h, w],
            targets.batch_size,
            targets.num_kernel_maps,
            targets.height,
            targets.width
        );
        let device = logits.device();
        let hw = h * w;
        let gt = targets_to_tensors::<B>(targets, &device);

        let text_prob = sigmoid(logits.clone().slice([0..b, k - 1..k, 0..h, 0..w]).reshape([b, h, w]));
        let score = tensor_to_vec(text_prob.clone())?;

        let mut selected = Vec::with_capacity(b * hw);
        for i in 0..b {
            let range = i * hw..(i + 1) * hw;
            selected.extend(ohem_mask(
                &score[range.clone()],
                &targets.score_maps[range.clone()],
                &targets.training_masks[range],
                self.ohem_ratio,
            ));
        }
        let selected = Tensor::<B, 3>::from_data(TensorData::new(selected, [b, h, w]), &device);
        let c_loss = self.dice(text_prob, gt.score_maps, selected);

        let kernel_mask: Vec<f32> = score
            .iter()
            .zip(&targets.training_masks)
            .map(|(&s, &m)| if s > 0.5 && m > 0.5 { 1.0 } else { 0.0 })
            .collect();
        let kernel_mask = Tensor::<B, 3>::from_data(TensorData::new(kernel_mask, [b, h, w]), &device);

        let (kernel_loss, kernel_acc) = if k > 1 {
            let kernel_prob = sigmoid(logits.slice([0..b, 0..k - 1, 0..h, 0..w]));
            let per_kernel: Vec<Tensor<B, 1>> = (0..k - 1)
                .map(|j| {
                    let pred = kernel_prob.clone().slice([0..b, j..j + 1, 0..h, 0..w]).reshape([b, h, w]);
                    let target = gt.kernels.clone().slice([0..b, j..j + 1, 0..h, 0..w]).reshape([b, h, w]);
                    self.dice(pred, target, kernel_mask.clone())
                })
                .collect();
            let kernel_acc = kernel_accuracy(&tensor_to_vec(kernel_prob)?, targets);
            (Tensor::stack::<2>(per_kernel, 1).mean_dim(1).reshape([b]), kernel_acc)
        } else {
            (Tensor::zeros([b], &device), 1.0)
        };

        let loss = c_loss.clone().mul_scalar(self.lam) + kernel_loss.clone().mul_scalar(1.0 - self.lam);
        let pixel_acc = pixel_accuracy(&score, &targets.score_maps, &targets.training_masks);

        Ok(LossOutput {
            loss,
            c_loss,
            kernel_loss,
            pixel_acc,
            kernel_acc,
        })
    }

    /// Per-sample `1 - 2|X∩Y| / (|X|² + |Y|²)` over the masked pixels.
    fn dice<B: Backend>(&self, input: Tensor<B, 3>, target: Tensor<B, 3>, mask: Tensor<B, 3>) -> Tensor<B, 1> {
        let [b, h, w] = input.dims();
        let input = (input * mask.clone()).reshape([b, h * w]);
        let target = (target * mask).reshape([b, h * w]);

        let inter = (input.clone() * target.clone()).sum_dim(1);
        let a = (input.clone() * input).sum_dim(1).add_scalar(self.eps);
        let c = (target.clone() * target).sum_dim(1).add_scalar(self.eps);
        let coefficient = inter.mul_scalar(2.0) / (a + c);
        coefficient.neg().add_scalar(1.0).reshape([b])
    }
}

/// OHEM selection for one sample, all slices `h * w` long.
///
/// Keeps every positive inside the training mask plus the `min(#neg, ratio * #pos)`
/// highest-scoring negatives. Falls back to the training mask when there is
/// nothing to balance.
pub fn ohem_mask(score: &[f32], gt: &[f32], training_mask: &[f32], ratio: f64) -> Vec<f32> {
    let positives = gt
        .iter()
        .zip(training_mask)
        .filter(|(&g, &m)| g > 0.5 && m > 0.5)
        .count();
    let mut negatives: Vec<f32> = score
        .iter()
        .zip(gt)
        .filter(|(_, &g)| g <= 0.5)
        .map(|(&s, _)| s)
        .collect();
    let keep = negatives.len().min((positives as f64 * ratio) as usize);

    if positives == 0 || keep == 0 {
        return training_mask.to_vec();
    }

    let (_, &mut threshold, _) = negatives.select_nth_unstable_by(keep - 1, |a, b| b.total_cmp(a));
    score
        .iter()
        .zip(gt)
        .zip(training_mask)
        .map(|((&s, &g), &m)| if (s >= threshold || g > 0.5) && m > 0.5 { 1.0 } else { 0.0 })
        .collect()
}

/// Share of training-mask pixels where `score > 0.5` agrees with `gt > 0.5`.
pub fn pixel_accuracy(score: &[f32], gt: &[f32], training_mask: &[f32]) -> f64 {
    let (mut correct, mut total) = (0usize, 0usize);
    for ((&s, &g), &m) in score.iter().zip(gt).zip(training_mask) {
        if m > 0.5 {
            total += 1;
            correct += usize::from((s > 0.5) == (g > 0.5));
        }
    }
    if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    }
}

/// Kernel agreement inside ground-truth text, `kernel_prob` laid out as `(batch, K-1, h, w)`.
pub fn kernel_accuracy(kernel_prob: &[f32], targets: &TargetBatch) -> f64 {
    let hw = targets.height * targets.width;
    let maps = targets.num_kernel_maps;
    let (mut correct, mut total) = (0usize, 0usize);
    for i in 0..targets.batch_size {
        for p in 0..hw {
            let idx = i * hw + p;
            if targets.score_maps[idx] <= 0.5 || targets.training_masks[idx] <= 0.5 {
                continue;
            }
            for j in 0..maps {
                let at = (i * maps + j) * hw + p;
                total += 1;
                correct += usize::from((kernel_prob[at] > 0.5) == (targets.kernels[at] > 0.5));
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    }
}
