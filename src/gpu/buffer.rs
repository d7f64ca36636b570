//! GPU buffer management
//!
//! `GpuBuffer` wraps a wgpu storage buffer and provides methods for
//! transferring data between CPU and GPU.

use super::context::get_sync_timeout_secs;
use super::get_gpu_context;
use std::sync::mpsc;
use std::time::Duration;

/// Storage buffers must not be empty, so zero-length tensors get one slot
const MIN_BUFFER_BYTES: u64 = 4;

/// A buffer that lives on the GPU
///
/// This is analogous to a `Vec<f32>` but the data lives in GPU memory.
/// We need to explicitly copy data to/from the CPU.
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    /// Size in number of f32 elements
    len: usize,
}

impl GpuBuffer {
    fn byte_size(len: usize) -> u64 {
        ((len * std::mem::size_of::<f32>()) as u64).max(MIN_BUFFER_BYTES)
    }

    fn allocate(len: usize, label: &str) -> Option<wgpu::Buffer> {
        let ctx = get_gpu_context()?;
        Some(ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: Self::byte_size(len),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    /// Create a new GPU buffer from CPU data
    #[must_use]
    pub fn from_slice(data: &[f32]) -> Option<Self> {
        let ctx = get_gpu_context()?;
        let buffer = Self::allocate(data.len(), "Tensor Buffer")?;
        if !data.is_empty() {
            ctx.queue()
                .write_buffer(&buffer, 0, bytemuck::cast_slice(data));
        }
        Some(GpuBuffer {
            buffer,
            len: data.len(),
        })
    }

    /// Create a zeroed GPU buffer of a given size
    ///
    /// wgpu guarantees new buffers read as zero.
    #[must_use]
    pub fn zeros(len: usize) -> Option<Self> {
        let buffer = Self::allocate(len, "Tensor Buffer (zeros)")?;
        Some(GpuBuffer { buffer, len })
    }

    /// Copy data from GPU back to CPU
    ///
    /// Blocks until the device has finished every submission touching this
    /// buffer. Returns an empty vector and logs if the read-back fails; use
    /// [`GpuBuffer::try_to_vec`] where that must not go unnoticed.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        match self.try_to_vec() {
            Some(v) => v,
            None => {
                tracing::warn!(len = self.len, "GPU read-back failed");
                Vec::new()
            }
        }
    }

    /// Copy data from GPU back to CPU, None if the read-back fails
    #[must_use]
    pub fn try_to_vec(&self) -> Option<Vec<f32>> {
        if self.len == 0 {
            return Some(Vec::new());
        }
        let ctx = get_gpu_context()?;
        let byte_size = (self.len * std::mem::size_of::<f32>()) as u64;

        // STORAGE buffers can't be mapped, so go through a MAP_READ staging buffer
        let staging_buffer = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: byte_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Read Buffer Encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging_buffer, 0, byte_size);
        ctx.queue().submit(Some(encoder.finish()));
        ctx.increment_pending();

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            // receiver outlives the poll below
            let _ = sender.send(result);
        });

        if let Err(e) = ctx.device().poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: Some(Duration::from_secs(get_sync_timeout_secs())),
        }) {
            tracing::warn!(error = ?e, "device poll failed during read-back");
            return None;
        }

        receiver.recv().ok()?.ok()?;

        let data = buffer_slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        Some(result)
    }

    /// Get the underlying wgpu buffer (for use in compute passes)
    #[must_use]
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Get the number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::is_gpu_available;

    #[test]
    fn upload_and_read_back() {
        if !is_gpu_available() {
            return;
        }
        let buf = GpuBuffer::from_slice(&[1.0, -2.0, 3.5]).expect("upload");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.to_vec(), vec![1.0, -2.0, 3.5]);
    }

    #[test]
    fn zeros_reads_as_zero() {
        if !is_gpu_available() {
            return;
        }
        let buf = GpuBuffer::zeros(5).expect("alloc");
        assert_eq!(buf.to_vec(), vec![0.0; 5]);
        assert!(GpuBuffer::zeros(0).expect("alloc").to_vec().is_empty());
    }
}
