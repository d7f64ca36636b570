//! GPU implementations of the deconvolution
//!
//! Called from `ops::deconv` when every operand lives in GPU storage.
//! Results are read back once into the storage's host mirror.

use crate::error::{NdconvError, Result};
use crate::gpu::{DeconvGeometryParams, GpuBuffer, GpuKernels};
use crate::ops::deconv::{DeconvAlgo, DeconvGeometry};
use crate::storage::Storage;
use crate::RawTensor;

fn device_err(what: &str) -> NdconvError {
    NdconvError::DeviceError(format!("GPU {what} failed"))
}

fn buffer_of<'a>(s: &'a Storage, name: &str) -> Result<&'a GpuBuffer> {
    s.gpu_buffer()
        .ok_or_else(|| NdconvError::DeviceError(format!("{name} is not in GPU storage")))
}

impl DeconvGeometry {
    /// Kernel parameters, padded to three spatial axes
    fn gpu_params(&self, has_bias: bool) -> Result<DeconvGeometryParams> {
        DeconvGeometryParams::new(
            self.batch,
            self.in_channels,
            self.out_channels,
            has_bias,
            &self.in_size,
            &self.out_size,
            &self.ksize,
            &self.stride,
            &self.pad,
        )
        .ok_or_else(|| {
            NdconvError::DeviceError(format!(
                "GPU kernels support 1 to 3 spatial dimensions, got {}",
                self.ndim()
            ))
        })
    }
}

impl RawTensor {
    /// GPU forward pass
    ///
    /// `Direct` runs the fused kernel; `Gemm` runs a batched matmul into
    /// columns and folds them with col2im.
    pub(crate) fn gpu_deconv_forward(
        geom: &DeconvGeometry,
        x: &Storage,
        w: &Storage,
        b: Option<&Storage>,
        algo: DeconvAlgo,
    ) -> Result<Storage> {
        let params = geom.gpu_params(b.is_some())?;
        let buf_x = buffer_of(x, "x")?;
        let buf_w = buffer_of(w, "W")?;
        // The bias binding always needs a buffer; the kernel ignores it without bias
        let placeholder;
        let buf_b = match b {
            Some(b) => buffer_of(b, "b")?,
            None => {
                placeholder = GpuBuffer::from_slice(&[0.0]).ok_or_else(|| device_err("allocation"))?;
                &placeholder
            }
        };

        let result = match algo {
            DeconvAlgo::Direct => GpuKernels::deconv_forward(&params, buf_x, buf_w, buf_b),
            DeconvAlgo::Gemm => {
                let rows = geom.out_channels * geom.kernel_spatial();
                let cols = GpuKernels::matmul_batched(
                    buf_w,
                    buf_x,
                    rows,
                    geom.in_channels,
                    geom.in_spatial(),
                    geom.batch,
                    true,
                )
                .ok_or_else(|| device_err("matmul"))?;
                GpuKernels::col2im(&params, &cols, buf_b)
            }
        }
        .ok_or_else(|| device_err("deconvolution forward"))?;

        Storage::from_gpu_buffer(result)
    }

    /// GPU backward pass, returning `(gx, gW, gb)`
    ///
    /// Only the input gradient depends on `algo`; the weight and bias
    /// gradients always use the direct kernels.
    pub(crate) fn gpu_deconv_backward(
        geom: &DeconvGeometry,
        x: &Storage,
        w: &Storage,
        gy: &Storage,
        has_bias: bool,
        algo: DeconvAlgo,
    ) -> Result<(Storage, Storage, Option<Storage>)> {
        let params = geom.gpu_params(has_bias)?;
        let buf_x = buffer_of(x, "x")?;
        let buf_w = buffer_of(w, "W")?;
        let buf_gy = buffer_of(gy, "gy")?;

        let gx = match algo {
            DeconvAlgo::Direct => GpuKernels::deconv_backward_input(&params, buf_gy, buf_w),
            DeconvAlgo::Gemm => {
                let cols = GpuKernels::im2col(&params, buf_gy).ok_or_else(|| device_err("im2col"))?;
                GpuKernels::matmul_batched(
                    buf_w,
                    &cols,
                    geom.in_channels,
                    geom.out_channels * geom.kernel_spatial(),
                    geom.in_spatial(),
                    geom.batch,
                    false,
                )
            }
        }
        .ok_or_else(|| device_err("input gradient"))?;

        let gw = GpuKernels::deconv_backward_weight(&params, buf_x, buf_gy)
            .ok_or_else(|| device_err("weight gradient"))?;

        let gb = if has_bias {
            let gb = GpuKernels::deconv_backward_bias(&params, buf_gy)
                .ok_or_else(|| device_err("bias gradient"))?;
            Some(Storage::from_gpu_buffer(gb)?)
        } else {
            None
        };

        Ok((Storage::from_gpu_buffer(gx)?, Storage::from_gpu_buffer(gw)?, gb))
    }
}
