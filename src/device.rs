// ===== DEVICE ENUM =====

/// Compute device for tensor operations
///
/// `GPU` carries the adapter name reported by wgpu. Without the `gpu`
/// feature the variant still exists so code can name it, but storage moved
/// there stays in host memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    CPU,
    GPU(String),
}

impl Device {
    /// The GPU device, if an adapter could be initialised
    #[must_use]
    pub fn gpu() -> Option<Device> {
        #[cfg(feature = "gpu")]
        {
            crate::gpu::get_gpu_context().map(|ctx| Device::GPU(ctx.device_name().to_string()))
        }
        #[cfg(not(feature = "gpu"))]
        {
            None
        }
    }

    #[must_use]
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::CPU)
    }

    #[must_use]
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::GPU(_))
    }

    /// Short name used in log lines and error messages
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Device::CPU => "cpu",
            Device::GPU(name) => name,
        }
    }

    /// Devices are interchangeable when they are the same backend. There is
    /// only ever one GPU context, so the adapter name is not compared.
    #[must_use]
    pub fn same_backend(&self, other: &Device) -> bool {
        self.is_gpu() == other.is_gpu()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::CPU => write!(f, "cpu"),
            Device::GPU(name) => write!(f, "gpu({name})"),
        }
    }
}
