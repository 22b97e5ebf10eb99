//! Data-parallel sequencing of one batch across device shards.

/// One device's share of a data-parallel step.
///
/// `forward` runs the network and loss for a shard and returns whatever must
/// survive until the backward pass. `backward` consumes it, accumulates the
/// shard's gradients and returns the shard's mean loss.
pub trait ShardStep {
    type Shard;
    type Pending;

    fn forward(&mut self, device_index: usize, shard: Self::Shard) -> anyhow::Result<Self::Pending>;

    fn backward(&mut self, device_index: usize, pending: Self::Pending) -> anyhow::Result<f64>;
}

/// Run every shard's forward, then every shard's backward, in device order.
///
/// No backward starts before all forwards have finished. Returns the mean of
/// the per-shard mean losses; an empty shard list yields `0.0`.
pub fn forward_then_backward<S: ShardStep>(step: &mut S, shards: Vec<S::Shard>) -> anyhow::Result<f64> {
    let mut pending = Vec::with_capacity(shards.len());
    for (device_index, shard) in shards.into_iter().enumerate() {
        pending.push(step.forward(device_index, shard)?);
    }

    let count = pending.len();
    let mut total = 0.0;
    for (device_index, p) in pending.into_iter().enumerate() {
        total += step.backward(device_index, p)?;
    }
    Ok(if count == 0 { 0.0 } else { total / count as f64 })
}
