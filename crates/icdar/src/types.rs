use std::path::PathBuf;

/// Errors that can occur while reading or preparing dataset samples.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// IO error while listing or reading dataset files.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Image could not be decoded.
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Malformed ground-truth line.
    #[error("bad annotation at {path}:{line}: {reason}")]
    Annotation {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Image has no matching ground-truth file.
    #[error("no ground truth for image {0}")]
    MissingGroundTruth(PathBuf),

    /// Dataset directory contains no images.
    #[error("no images found under {0}")]
    Empty(PathBuf),

    /// Sample index past the end of the dataset.
    #[error("index {index} out of range for dataset of length {len}")]
    OutOfRange { index: usize, len: usize },

    /// Samples in one batch have different geometry.
    #[error("sample shape (h, w, kernels) {actual:?} does not match batch shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    /// Attempted to build a batch from zero samples.
    #[error("cannot build an empty batch")]
    EmptyBatch,

    /// Batch cannot be split evenly across shards.
    #[error("batch of {batch} samples cannot be split into {shards} equal shards")]
    UnevenSplit { batch: usize, shards: usize },
}

/// One annotated text region.
#[derive(Debug, Clone, PartialEq)]
pub struct TextInstance {
    /// Polygon vertices in pixel coordinates, in annotation order.
    pub points: Vec<[f32; 2]>,
    /// Transcription as written in the ground truth file.
    pub transcription: String,
    /// "Do not care" region (`###`): masked out of the loss instead of being a target.
    pub ignored: bool,
}

impl TextInstance {
    pub fn new(points: Vec<[f32; 2]>, transcription: impl Into<String>) -> Self {
        let transcription = transcription.into();
        let ignored = transcription == "###";
        Self {
            points,
            transcription,
            ignored,
        }
    }

    /// Apply `(x, y) -> (x * sx + dx, y * sy + dy)` to every vertex.
    pub fn transformed(&self, sx: f32, sy: f32, dx: f32, dy: f32) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|[x, y]| [x * sx + dx, y * sy + dy])
                .collect(),
            transcription: self.transcription.clone(),
            ignored: self.ignored,
        }
    }
}

/// An image path together with its text instances.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub image: PathBuf,
    pub instances: Vec<TextInstance>,
}

/// A fully prepared training sample.
///
/// All maps share the same `height x width` grid. Buffers are row-major:
/// - `image`: `[3, H, W]`, normalised to roughly zero mean / unit variance
/// - `score_map`: `[H, W]`, 1.0 inside non-ignored text
/// - `kernels`: `[K-1, H, W]`, shrunk text kernels, largest first
/// - `training_mask`: `[H, W]`, 0.0 inside ignored regions
/// - `original`: `[H, W, 3]` RGB bytes of the resized (un-normalised) image
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Vec<f32>,
    pub score_map: Vec<f32>,
    pub kernels: Vec<f32>,
    pub training_mask: Vec<f32>,
    pub original: Vec<u8>,
    pub height: usize,
    pub width: usize,
    /// Number of shrunk kernel maps stored in `kernels`.
    pub num_kernel_maps: usize,
}

