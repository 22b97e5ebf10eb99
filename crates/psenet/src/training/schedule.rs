/// Polynomial learning-rate decay over a fixed update budget.
///
/// `lr(t) = final_lr + (base_lr - final_lr) * (1 - t / max_update)^power` for
/// `t <= max_update`, and `final_lr` afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PolySchedule {
    pub base_lr: f64,
    pub max_update: usize,
    pub power: f64,
    pub final_lr: f64,
}

impl PolySchedule {
    /// Quadratic decay to zero, `max_update` clamped to at least one step.
    pub fn new(base_lr: f64, max_update: usize) -> Self {
        Self {
            base_lr,
            max_update: max_update.max(1),
            power: 2.0,
            final_lr: 0.0,
        }
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    pub fn with_final_lr(mut self, final_lr: f64) -> Self {
        self.final_lr = final_lr;
        self
    }

    /// Update budget for a run: `dataset_len * epochs / global_batch` (integer division).
    pub fn budget(dataset_len: usize, epochs: usize, global_batch: usize) -> usize {
        dataset_len * epochs / global_batch.max(1)
    }

    /// Learning rate for the update following `updates` completed updates.
    pub fn lr(&self, updates: usize) -> f64 {
        if updates >= self.max_update {
            return self.final_lr;
        }
        let remaining = 1.0 - updates as f64 / self.max_update as f64;
        self.final_lr + (self.base_lr - self.final_lr) * remaining.powf(self.power)
    }
}
