//! Tensor bridge: host-side batches (`Vec<f32>` buffers from the loader) to
//! burn tensors and back.

use burn::prelude::*;
use burn::tensor::TensorData;
use icdar::{HostBatch, TargetBatch};

/// Images of a batch as `(batch, 3, H, W)`.
pub fn images_to_tensor<B: Backend>(batch: &HostBatch, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(
        TensorData::new(batch.images.clone(), [batch.batch_size(), 3, batch.height(), batch.width()]),
        device,
    )
}

/// Score maps and training masks as `(batch, H, W)`; kernels as `(batch, K-1, H, W)`.
pub struct TargetTensors<B: Backend> {
    pub score_maps: Tensor<B, 3>,
    pub kernels: Tensor<B, 4>,
    pub training_masks: Tensor<B, 3>,
}

pub fn targets_to_tensors<B: Backend>(targets: &TargetBatch, device: &B::Device) -> TargetTensors<B> {
    let (b, k, h, w) = (targets.batch_size, targets.num_kernel_maps, targets.height, targets.width);
    TargetTensors {
        score_maps: Tensor::from_data(TensorData::new(targets.score_maps.clone(), [b, h, w]), device),
        kernels: Tensor::from_data(TensorData::new(targets.kernels.clone(), [b, k, h, w]), device),
        training_masks: Tensor::from_data(TensorData::new(targets.training_masks.clone(), [b, h, w]), device),
    }
}

/// Host `f32` values of any tensor, row-major.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> anyhow::Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read tensor data: {e:?}"))
}

/// One `(H, W)` plane, `maps[sample, channel]`, as host values.
pub fn plane<B: Backend>(maps: Tensor<B, 4>, sample: usize, channel: usize) -> anyhow::Result<Vec<f32>> {
    let [b, c, h, w] = maps.dims();
    anyhow::ensure!(
        sample < b && channel < c,
        "plane ({sample}, {channel}) out of range for maps of shape {:?}",
        [b, c, h, w]
    );
    tensor_to_vec(maps.slice([sample..sample + 1, channel..channel + 1, 0..h, 0..w]))
}
