//! ICDAR-style scene text detection data for PSENet training.
//!
//! Reads `img/` + `gt/` directories, rasterises text polygons into the
//! progressive-scale kernel targets PSENet is trained on, and batches
//! samples for data-parallel training.

pub mod dataset;
pub mod geometry;
pub mod loader;
pub mod reader;
pub mod targets;
pub mod types;

pub use dataset::{DatasetConfig, IcdarDataset, SampleSource, SyntheticDataset};
pub use loader::{DataLoader, EpochIter, HostBatch, TargetBatch};
pub use targets::{build_targets, kernel_ratios, Targets};
pub use types::{Annotation, DatasetError, Sample, TextInstance};
