//! Shuffled mini-batch loading and host-side batch slicing.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::SampleSource;
use crate::types::{DatasetError, Sample};

/// Supervision maps for a batch, row-major with batch first.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetBatch {
    /// `[B, H, W]`
    pub score_maps: Vec<f32>,
    /// `[B, K-1, H, W]`
    pub kernels: Vec<f32>,
    /// `[B, H, W]`
    pub training_masks: Vec<f32>,
    pub batch_size: usize,
    pub num_kernel_maps: usize,
    pub height: usize,
    pub width: usize,
}

impl TargetBatch {
    /// Keep every `stride`-th row and column (`[:, ::s, ::s]`).
    pub fn downsample(&self, stride: usize) -> TargetBatch {
        let stride = stride.max(1);
        let (h, w) = (self.height, self.width);
        let oh = h.div_ceil(stride);
        let ow = w.div_ceil(stride);
        let pick = |src: &[f32], planes: usize| {
            let mut out = Vec::with_capacity(planes * oh * ow);
            for p in 0..planes {
                let plane = &src[p * h * w..(p + 1) * h * w];
                for y in (0..h).step_by(stride) {
                    for x in (0..w).step_by(stride) {
                        out.push(plane[y * w + x]);
                    }
                }
            }
            out
        };
        TargetBatch {
            score_maps: pick(&self.score_maps, self.batch_size),
            kernels: pick(&self.kernels, self.batch_size * self.num_kernel_maps),
            training_masks: pick(&self.training_masks, self.batch_size),
            batch_size: self.batch_size,
            num_kernel_maps: self.num_kernel_maps,
            height: oh,
            width: ow,
        }
    }
}

/// A collated batch of samples, still in host memory.
#[derive(Debug, Clone)]
pub struct HostBatch {
    /// `[B, 3, H, W]`
    pub images: Vec<f32>,
    pub targets: TargetBatch,
    /// Dataset indices of the samples, in batch order.
    pub indices: Vec<usize>,
}

impl HostBatch {
    /// Stack samples of identical geometry into one batch.
    pub fn stack(samples: &[Sample], indices: Vec<usize>) -> Result<Self, DatasetError> {
        let first = samples.first().ok_or(DatasetError::EmptyBatch)?;
        let (h, w, k) = (first.height, first.width, first.num_kernel_maps);
        for s in samples {
            if (s.height, s.width, s.num_kernel_maps) != (h, w, k) {
                return Err(DatasetError::ShapeMismatch {
                    expected: (h, w, k),
                    actual: (s.height, s.width, s.num_kernel_maps),
                });
            }
        }
        let b = samples.len();
        let mut images = Vec::with_capacity(b * 3 * h * w);
        let mut score_maps = Vec::with_capacity(b * h * w);
        let mut kernels = Vec::with_capacity(b * k * h * w);
        let mut training_masks = Vec::with_capacity(b * h * w);
        for s in samples {
            images.extend_from_slice(&s.image);
            score_maps.extend_from_slice(&s.score_map);
            kernels.extend_from_slice(&s.kernels);
            training_masks.extend_from_slice(&s.training_mask);
        }
        Ok(Self {
            images,
            targets: TargetBatch {
                score_maps,
                kernels,
                training_masks,
                batch_size: b,
                num_kernel_maps: k,
                height: h,
                width: w,
            },
            indices,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.targets.batch_size
    }

    pub fn height(&self) -> usize {
        self.targets.height
    }

    pub fn width(&self) -> usize {
        self.targets.width
    }

    /// Split into `shards` contiguous, equally sized sub-batches.
    pub fn split(&self, shards: usize) -> Result<Vec<HostBatch>, DatasetError> {
        let b = self.batch_size();
        if shards == 0 || b % shards != 0 {
            return Err(DatasetError::UnevenSplit { batch: b, shards });
        }
        let per = b / shards;
        let (h, w, k) = (self.height(), self.width(), self.targets.num_kernel_maps);
        let hw = h * w;
        let cut_f = |src: &[f32], stride: usize, i: usize| src[i * per * stride..(i + 1) * per * stride].to_vec();

        Ok((0..shards)
            .map(|i| HostBatch {
                images: cut_f(&self.images, 3 * hw, i),
                targets: TargetBatch {
                    score_maps: cut_f(&self.targets.score_maps, hw, i),
                    kernels: cut_f(&self.targets.kernels, k * hw, i),
                    training_masks: cut_f(&self.targets.training_masks, hw, i),
                    batch_size: per,
                    num_kernel_maps: k,
                    height: h,
                    width: w,
                },
                indices: self.indices[i * per..(i + 1) * per].to_vec(),
            })
            .collect())
    }
}

/// Mini-batch loader over any [`SampleSource`].
///
/// Each call to [`DataLoader::epoch`] reshuffles (when enabled) and yields
/// batches in the new order. The same seeded generator drives sample
/// augmentation, so a seed fixes the whole data stream.
pub struct DataLoader<S> {
    source: S,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    rng: StdRng,
}

impl<S: SampleSource> DataLoader<S> {
    pub fn new(source: S, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            shuffle: true,
            drop_last: false,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Drop a trailing batch smaller than `batch_size`.
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Number of batches one epoch yields.
    pub fn num_batches(&self) -> usize {
        let n = self.source.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Start a new pass over the data.
    pub fn epoch(&mut self) -> EpochIter<'_, S> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        if self.drop_last {
            order.truncate(self.num_batches() * self.batch_size);
        }
        EpochIter {
            source: &self.source,
            rng: &mut self.rng,
            order,
            batch_size: self.batch_size,
            pos: 0,
        }
    }
}

/// One epoch of batches.
pub struct EpochIter<'a, S> {
    source: &'a S,
    rng: &'a mut StdRng,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl<S: SampleSource> Iterator for EpochIter<'_, S> {
    type Item = Result<HostBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let indices = self.order[self.pos..end].to_vec();
        self.pos = end;

        let samples: Result<Vec<Sample>, DatasetError> =
            indices.iter().map(|&i| self.source.get(i, &mut *self.rng)).collect();
        Some(samples.and_then(|s| HostBatch::stack(&s, indices)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetConfig, SyntheticDataset};

    fn dataset(len: usize) -> SyntheticDataset {
        SyntheticDataset::new(
            len,
            DatasetConfig {
                input_size: 16,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_epoch_covers_all_samples_once() {
        let mut loader = DataLoader::new(dataset(5), 2).with_seed(3);
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<HostBatch> = loader.epoch().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].batch_size(), 1);

        let mut seen: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_last_and_no_shuffle() {
        let mut loader = DataLoader::new(dataset(5), 2)
            .with_shuffle(false)
            .with_drop_last(true);
        assert_eq!(loader.num_batches(), 2);
        let batches: Vec<HostBatch> = loader.epoch().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].indices, vec![0, 1]);
        assert_eq!(batches[1].indices, vec![2, 3]);
    }

    #[test]
    fn test_reshuffles_between_epochs() {
        let mut loader = DataLoader::new(dataset(16), 16).with_seed(11);
        let a = loader.epoch().next().unwrap().unwrap().indices;
        let b = loader.epoch().next().unwrap().unwrap().indices;
        assert_ne!(a, b);
    }

    #[test]
    fn test_split_into_equal_shards() {
        let mut loader = DataLoader::new(dataset(4), 4).with_shuffle(false);
        let batch = loader.epoch().next().unwrap().unwrap();
        let shards = batch.split(2).unwrap();
        assert_eq!(shards.len(), 2);
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.batch_size(), 2);
            assert_eq!(shard.indices, vec![2 * i, 2 * i + 1]);
            assert_eq!(shard.images.len(), 2 * 3 * 16 * 16);
            assert_eq!(shard.targets.kernels.len(), 2 * 2 * 16 * 16);
        }
        assert_eq!(shards[1].targets.score_maps[..], batch.targets.score_maps[2 * 256..]);
        assert!(matches!(batch.split(3), Err(DatasetError::UnevenSplit { batch: 4, shards: 3 })));
    }

    #[test]
    fn test_downsample_strides() {
        let targets = TargetBatch {
            score_maps: (0..2 * 8 * 8).map(|v| v as f32).collect(),
            kernels: vec![1.0; 2 * 8 * 8],
            training_masks: vec![1.0; 2 * 8 * 8],
            batch_size: 2,
            num_kernel_maps: 1,
            height: 8,
            width: 8,
        };
        let down = targets.downsample(4);
        assert_eq!((down.height, down.width), (2, 2));
        assert_eq!(down.score_maps, vec![0.0, 4.0, 32.0, 36.0, 64.0, 68.0, 96.0, 100.0]);
        assert_eq!(down.kernels.len(), 2 * 4);

        let odd = TargetBatch {
            height: 6,
            width: 5,
            score_maps: vec![0.0; 30],
            kernels: vec![],
            training_masks: vec![0.0; 30],
            batch_size: 1,
            num_kernel_maps: 0,
        };
        let d = odd.downsample(4);
        assert_eq!((d.height, d.width), (2, 2));
    }
}
