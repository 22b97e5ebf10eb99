//! PSENet network: ResNet backbone, FPN decoder, kernel head, plus the
//! parameter-group, checkpoint and host/tensor plumbing around it.

pub mod backbone;
pub mod bridge;
pub mod checkpoint;
pub mod decoder;
pub mod params;
pub mod psenet;

pub use checkpoint::{load_checkpoint, load_pretrained, save_checkpoint, PretrainedReport};
pub use params::{ParamGroup, ParamGroupConfig, ParamGroups, WeightInit};
pub use psenet::{PseNet, PseNetConfig, OUTPUT_STRIDE};
