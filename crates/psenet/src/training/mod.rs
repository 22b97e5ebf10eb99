//! PSENet training pipeline: dice/OHEM loss, polynomial LR schedule,
//! device sets and shard sequencing, metric summaries and the epoch loop.

pub mod device;
pub mod loss;
pub mod metrics;
pub mod parallel;
pub mod schedule;
pub mod summary;
pub mod trainer;

pub use device::DeviceSet;
pub use loss::{DiceLossWithOhem, LossOutput};
pub use parallel::{forward_then_backward, ShardStep};
pub use schedule::PolySchedule;
pub use summary::{read_events, SummaryEvent, SummaryWriter};
pub use trainer::{global_step, prepare_model, train, TrainReport, TrainingConfig};
