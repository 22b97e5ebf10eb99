use burn::tensor::backend::Backend;

/// Non-empty, ordered set of devices a batch is split across.
///
/// The first device is the primary: it holds the master copy of the model and
/// receives the accumulated gradients.
#[derive(Debug, Clone)]
pub struct DeviceSet<B: Backend> {
    devices: Vec<B::Device>,
}

impl<B: Backend> DeviceSet<B> {
    pub fn new(devices: Vec<B::Device>) -> anyhow::Result<Self> {
        anyhow::ensure!(!devices.is_empty(), "device set must contain at least one device");
        Ok(Self { devices })
    }

    pub fn single(device: B::Device) -> Self {
        Self { devices: vec![device] }
    }

    pub fn primary(&self) -> &B::Device {
        &self.devices[0]
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, B::Device> {
        self.devices.iter()
    }
}
