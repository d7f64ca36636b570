//! Tensor storage abstraction
//!
//! This module provides a unified interface for tensor data storage
//! that can be backed by either CPU memory or GPU buffers.

#[cfg(feature = "gpu")]
use crate::gpu::{GpuBuffer, is_gpu_available};

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{NdconvError, Result};

/// Storage backend for tensor data
///
/// GPU storage keeps a host mirror of the buffer contents. Every kernel in
/// this crate reads its result back once, so the mirror is always current and
/// host-side access never has to block on the device.
#[derive(Clone)]
pub enum Storage {
    /// CPU storage - data lives in main memory
    Cpu(Vec<f32>),

    /// GPU storage - data lives in GPU memory
    #[cfg(feature = "gpu")]
    Gpu {
        /// The GPU buffer (wrapped in Arc for cheap cloning)
        buffer: std::sync::Arc<GpuBuffer>,
        /// Host copy of `buffer`
        cpu_cache: Vec<f32>,
    },
}

impl Storage {
    /// Create new CPU storage from data
    pub fn cpu(data: Vec<f32>) -> Self {
        Storage::Cpu(data)
    }

    /// Create new GPU storage from data
    ///
    /// Fails with [`NdconvError::DeviceError`] when no GPU is available or the
    /// upload fails. Data never silently stays on the CPU.
    #[cfg(feature = "gpu")]
    pub fn gpu(data: Vec<f32>) -> Result<Self> {
        if !is_gpu_available() {
            return Err(NdconvError::DeviceError("GPU requested but not available".to_string()));
        }
        let buffer = GpuBuffer::from_slice(&data).ok_or_else(|| {
            NdconvError::DeviceError(format!("GPU allocation of {} elements failed", data.len()))
        })?;
        Ok(Storage::Gpu {
            buffer: std::sync::Arc::new(buffer),
            cpu_cache: data,
        })
    }

    #[cfg(not(feature = "gpu"))]
    pub fn gpu(_data: Vec<f32>) -> Result<Self> {
        Err(NdconvError::DeviceError("built without the gpu feature".to_string()))
    }

    /// Wrap a buffer produced by a kernel, reading it back once for the mirror
    #[cfg(feature = "gpu")]
    pub(crate) fn from_gpu_buffer(buffer: GpuBuffer) -> Result<Self> {
        let cpu_cache = buffer.try_to_vec().ok_or_else(|| {
            NdconvError::DeviceError(format!("GPU read-back of {} elements failed", buffer.len()))
        })?;
        Self::mirrored(buffer, cpu_cache)
    }

    /// Pair a buffer with its host copy, which must cover every element
    #[cfg(feature = "gpu")]
    fn mirrored(buffer: GpuBuffer, cpu_cache: Vec<f32>) -> Result<Self> {
        if cpu_cache.len() != buffer.len() {
            return Err(NdconvError::DeviceError(format!(
                "host mirror holds {} elements, GPU buffer {}",
                cpu_cache.len(),
                buffer.len()
            )));
        }
        Ok(Storage::Gpu {
            buffer: std::sync::Arc::new(buffer),
            cpu_cache,
        })
    }

    /// Element type of the stored values
    pub fn dtype(&self) -> DType {
        DType::F32
    }

    /// Get data as a slice
    pub fn as_slice(&self) -> &[f32] {
        match self {
            Storage::Cpu(data) => data,
            #[cfg(feature = "gpu")]
            Storage::Gpu { cpu_cache, .. } => cpu_cache,
        }
    }

    /// Get data as a mutable slice (only works for CPU storage)
    pub fn as_mut_slice(&mut self) -> Option<&mut [f32]> {
        match self {
            Storage::Cpu(data) => Some(data),
            #[cfg(feature = "gpu")]
            Storage::Gpu { .. } => None,
        }
    }

    /// Mutate the values in place on either backend
    ///
    /// GPU storage edits the host mirror and then uploads it again. The
    /// buffer is replaced rather than written through, since clones of this
    /// storage may share it. A failed upload leaves the storage unchanged.
    pub fn modify<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut [f32]),
    {
        match self {
            Storage::Cpu(data) => f(data),
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, cpu_cache } => {
                let mut edited = cpu_cache.clone();
                f(&mut edited);
                let fresh = GpuBuffer::from_slice(&edited)
                    .ok_or_else(|| NdconvError::DeviceError("GPU re-upload failed".to_string()))?;
                *buffer = std::sync::Arc::new(fresh);
                *cpu_cache = edited;
            }
        }
        Ok(())
    }

    /// Convert to Vec<f32>
    pub fn to_vec(&self) -> Vec<f32> {
        self.as_slice().to_vec()
    }

    /// Get the length
    pub fn len(&self) -> usize {
        match self {
            Storage::Cpu(data) => data.len(),
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, .. } => buffer.len(),
        }
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if this is GPU storage
    pub fn is_gpu(&self) -> bool {
        match self {
            Storage::Cpu(_) => false,
            #[cfg(feature = "gpu")]
            Storage::Gpu { .. } => true,
        }
    }

    /// Copy to a specific device
    ///
    /// A GPU target that can't be reached is an error, so storage on a
    /// tensor labelled GPU is always GPU storage.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        match device {
            Device::CPU => Ok(Storage::Cpu(self.to_vec())),
            Device::GPU(_) => Storage::gpu(self.to_vec()).inspect_err(|e| {
                tracing::warn!(%device, error = %e, "GPU transfer failed");
            }),
        }
    }

    /// Get the GPU buffer if this is GPU storage
    #[cfg(feature = "gpu")]
    pub fn gpu_buffer(&self) -> Option<&GpuBuffer> {
        match self {
            Storage::Gpu { buffer, .. } => Some(buffer.as_ref()),
            Storage::Cpu(_) => None,
        }
    }
}

impl PartialEq<Vec<f32>> for Storage {
    fn eq(&self, other: &Vec<f32>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Cpu(data) => write!(f, "Storage::Cpu({} elements)", data.len()),
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, .. } => write!(f, "Storage::Gpu({} elements)", buffer.len()),
        }
    }
}
