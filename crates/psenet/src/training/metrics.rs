/// Scalars reported for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMetrics {
    /// Mean over shards of each shard's mean loss.
    pub loss: f64,
    /// Text (OHEM) dice term of the last shard, averaged over its samples.
    pub c_loss: f64,
    /// Kernel dice term of the last shard, averaged over its samples.
    pub kernel_loss: f64,
    pub pixel_acc: f64,
    pub kernel_acc: f64,
}

impl BatchMetrics {
    /// Warnings for values that indicate a diverged or stuck run.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() {
            warnings.push(format!("loss is not finite ({})", self.loss));
        }
        if self.loss > 1.0 + 1e-6 {
            warnings.push(format!("dice loss above 1.0 ({:.4})", self.loss));
        }
        if self.pixel_acc.is_nan() || self.kernel_acc.is_nan() {
            warnings.push("accuracy is NaN".to_string());
        }
        warnings
    }
}

/// Mean of values seen since the last reset.
#[derive(Debug, Clone, Default)]
pub struct RunningLoss {
    sum: f64,
    count: usize,
}

impl RunningLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}
