//! PSENet scene text detection on burn.
//!
//! A ResNet + FPN network predicting a full text map and progressively shrunk
//! text kernels, trained with a dice loss using online hard example mining.
//! The training loop splits each batch across a [`training::DeviceSet`],
//! decays the learning rate polynomially and writes one parameter file per
//! epoch.

pub mod model;
pub mod training;

pub use model::{PseNet, PseNetConfig};
pub use training::{train, DeviceSet, TrainReport, TrainingConfig};
