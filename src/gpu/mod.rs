//! GPU backend for the deconvolution using wgpu
//!
//! - `GpuContext`: device, queue and compiled pipelines
//! - `GpuBuffer`: tensor data resident on the GPU
//! - `GpuKernels`: dispatch of the WGSL kernels

mod buffer;
mod context;
mod kernels;

pub use buffer::GpuBuffer;
pub use context::GpuContext;
pub use kernels::{DeconvGeometryParams, GpuKernels, MatMulParams};

use std::sync::OnceLock;

// Global GPU context - initialized lazily on first use
static GPU_CONTEXT: OnceLock<Option<GpuContext>> = OnceLock::new();

/// Get the global GPU context, initializing it if necessary
/// Returns None if GPU is not available
pub fn get_gpu_context() -> Option<&'static GpuContext> {
    GPU_CONTEXT
        .get_or_init(|| match GpuContext::new() {
            Ok(ctx) => {
                tracing::info!(adapter = ctx.device_name(), "GPU initialized");
                Some(ctx)
            }
            Err(e) => {
                tracing::warn!(error = %e, "GPU initialization failed, falling back to CPU");
                None
            }
        })
        .as_ref()
}

/// Check if GPU is available
pub fn is_gpu_available() -> bool {
    get_gpu_context().is_some()
}

/// Wait for all pending GPU commands to complete
///
/// Returns true if sync completed (or there is no GPU), false on timeout.
pub fn gpu_sync() -> bool {
    get_gpu_context().map(|ctx| ctx.sync()).unwrap_or(true)
}
