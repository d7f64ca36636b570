//! GPU context management
//!
//! The `GpuContext` holds the wgpu device and queue, which are needed
//! for all GPU operations, plus the compiled deconvolution pipelines.

use wgpu::PipelineCompilationOptions;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Timeout for a blocking device poll
const HARD_SYNC_TIMEOUT_SECS: u64 = 5;

/// Get the hard sync timeout from environment or default
///
/// ```bash
/// NDCONV_GPU_SYNC_TIMEOUT=20 cargo test --features gpu
/// ```
pub(crate) fn get_sync_timeout_secs() -> u64 {
    std::env::var("NDCONV_GPU_SYNC_TIMEOUT")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(HARD_SYNC_TIMEOUT_SECS)
}

/// Manages the GPU device, queue, and compiled compute pipelines
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    pipelines: ComputePipelines,
    /// Submissions since the last completed poll
    pending_submissions: AtomicU32,
}

/// Pre-compiled compute pipelines
///
/// Compiling shaders is expensive, so we do it once at initialization
/// and reuse the pipelines for all operations.
pub struct ComputePipelines {
    // Fused gather kernels
    pub deconv_forward: wgpu::ComputePipeline,
    pub deconv_backward_input: wgpu::ComputePipeline,
    pub deconv_backward_weight: wgpu::ComputePipeline,
    pub deconv_backward_bias: wgpu::ComputePipeline,

    // Column transforms for the GEMM path
    pub im2col: wgpu::ComputePipeline,
    pub col2im: wgpu::ComputePipeline,

    // Batched matrix multiplication with a shared left operand
    pub matmul: wgpu::ComputePipeline,
}

impl GpuContext {
    /// Initialize the GPU context
    ///
    /// Finds an adapter, creates a device and queue, and compiles the shaders.
    /// # Errors
    /// Returns a description of the failing step when no adapter or device
    /// can be obtained.
    pub fn new() -> Result<Self, String> {
        // wgpu is async, but we want a sync API for simplicity
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, String> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None, // compute only
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| format!("No suitable GPU adapter found: {e}"))?;

        let adapter_info = adapter.get_info();

        let device_descriptor = wgpu::DeviceDescriptor {
            label: Some("ndconv GPU Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        };

        let (device, queue) = adapter
            .request_device(&device_descriptor)
            .await
            .map_err(|e| format!("Failed to create device: {e}"))?;

        let pipelines = Self::create_pipelines(&device);

        Ok(Self {
            device,
            queue,
            adapter_info,
            pipelines,
            pending_submissions: AtomicU32::new(0),
        })
    }

    /// Get the GPU device name for display
    pub fn device_name(&self) -> &str {
        &self.adapter_info.name
    }

    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub const fn pipelines(&self) -> &ComputePipelines {
        &self.pipelines
    }

    /// Call after each `queue.submit()`
    pub fn increment_pending(&self) {
        let count = self.pending_submissions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(pending = count, "GPU submission queued");
    }

    pub fn pending_count(&self) -> u32 {
        self.pending_submissions.load(Ordering::Relaxed)
    }

    /// Wait for all submitted work to complete
    ///
    /// Returns false if the poll timed out. The pending counter is reset
    /// either way.
    pub fn sync(&self) -> bool {
        if self.pending_submissions.load(Ordering::Relaxed) == 0 {
            return true;
        }

        let result = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: Some(Duration::from_secs(get_sync_timeout_secs())),
        });
        self.pending_submissions.store(0, Ordering::Relaxed);

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = ?e, "GPU sync timed out");
                false
            }
        }
    }

    /// Create all compute pipelines by compiling shaders
    fn create_pipelines(device: &wgpu::Device) -> ComputePipelines {
        let deconv_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Deconvolution Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/deconv.wgsl").into()),
        });

        let matmul_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("MatMul Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/matmul.wgsl").into()),
        });

        let create_pipeline = |shader: &wgpu::ShaderModule, entry_point: &str, label: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None, // Auto-generate layout from shader
                module: shader,
                entry_point: Some(entry_point),
                compilation_options: PipelineCompilationOptions::default(),
                cache: None,
            })
        };

        ComputePipelines {
            deconv_forward: create_pipeline(
                &deconv_shader,
                "deconv_forward",
                "Deconv Forward Pipeline",
            ),
            deconv_backward_input: create_pipeline(
                &deconv_shader,
                "deconv_backward_input",
                "Deconv Backward Input Pipeline",
            ),
            deconv_backward_weight: create_pipeline(
                &deconv_shader,
                "deconv_backward_weight",
                "Deconv Backward Weight Pipeline",
            ),
            deconv_backward_bias: create_pipeline(
                &deconv_shader,
                "deconv_backward_bias",
                "Deconv Backward Bias Pipeline",
            ),
            im2col: create_pipeline(&deconv_shader, "im2col", "Im2col Pipeline"),
            col2im: create_pipeline(&deconv_shader, "col2im", "Col2im Pipeline"),
            matmul: create_pipeline(&matmul_shader, "matmul_batched", "MatMul Pipeline"),
        }
    }
}
