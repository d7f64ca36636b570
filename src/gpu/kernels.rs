//! GPU kernel execution
//!
//! Each operation builds a uniform parameter buffer, binds the pipeline's
//! buffers, dispatches one invocation per output element and submits.

use super::{GpuBuffer, get_gpu_context};
use wgpu::util::DeviceExt;

/// Invocations per workgroup, must match `@workgroup_size` in the shaders
const WORKGROUP_SIZE: u32 = 256;

/// Maximum workgroups along one dispatch dimension
const MAX_WORKGROUPS_PER_DIM: u32 = 65_535;

/// Geometry of a rank <= 3 transposed convolution
///
/// Mirrors `struct Geometry` in `deconv.wgsl`. Lower ranks are padded on the
/// left with unit axes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DeconvGeometryParams {
    pub batch: u32,
    pub c_in: u32,
    pub c_out: u32,
    pub has_bias: u32,
    pub in_size: [u32; 3],
    pub in_sp: u32,
    pub out_size: [u32; 3],
    pub out_sp: u32,
    pub ksize: [u32; 3],
    pub k_sp: u32,
    pub stride: [u32; 3],
    pub _pad0: u32,
    pub pad: [u32; 3],
    pub _pad1: u32,
}

impl DeconvGeometryParams {
    /// Build from per-axis sizes of rank 1 to 3
    ///
    /// Returns None for a higher rank or a size that doesn't fit in u32.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        batch: usize,
        c_in: usize,
        c_out: usize,
        has_bias: bool,
        in_size: &[usize],
        out_size: &[usize],
        ksize: &[usize],
        stride: &[usize],
        pad: &[usize],
    ) -> Option<Self> {
        fn lift(values: &[usize], fill: u32) -> Option<[u32; 3]> {
            if values.is_empty() || values.len() > 3 {
                return None;
            }
            let mut out = [fill; 3];
            let offset = 3 - values.len();
            for (slot, &v) in out[offset..].iter_mut().zip(values) {
                *slot = u32::try_from(v).ok()?;
            }
            Some(out)
        }

        let in_size = lift(in_size, 1)?;
        let out_size = lift(out_size, 1)?;
        let ksize = lift(ksize, 1)?;
        Some(Self {
            batch: u32::try_from(batch).ok()?,
            c_in: u32::try_from(c_in).ok()?,
            c_out: u32::try_from(c_out).ok()?,
            has_bias: u32::from(has_bias),
            in_sp: in_size.iter().product(),
            out_sp: out_size.iter().product(),
            k_sp: ksize.iter().product(),
            in_size,
            out_size,
            ksize,
            stride: lift(stride, 1)?,
            _pad0: 0,
            pad: lift(pad, 0)?,
            _pad1: 0,
        })
    }

    fn output_len(&self) -> usize {
        (self.batch * self.c_out * self.out_sp) as usize
    }

    fn input_len(&self) -> usize {
        (self.batch * self.c_in * self.in_sp) as usize
    }

    fn weight_len(&self) -> usize {
        (self.c_in * self.c_out * self.k_sp) as usize
    }

    fn cols_len(&self) -> usize {
        (self.batch * self.c_out * self.k_sp * self.in_sp) as usize
    }
}

/// Parameters for the batched matmul shader
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatMulParams {
    pub m: u32,
    pub k: u32,
    pub n: u32,
    pub batch: u32,
    pub trans_a: u32,
    pub _padding: [u32; 3],
}

/// High-level interface for GPU kernel execution
pub struct GpuKernels;

impl GpuKernels {
    /// Dispatch `pipeline` with `params` at binding 0, `inputs` at their
    /// bindings and a fresh output buffer of `output_len` at `output_binding`.
    fn dispatch(
        pipeline: &wgpu::ComputePipeline,
        label: &str,
        params: &[u8],
        inputs: &[(u32, &GpuBuffer)],
        output_binding: u32,
        output_len: usize,
    ) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        let result = GpuBuffer::zeros(output_len)?;
        if output_len == 0 {
            return Some(result);
        }

        let params_buffer = ctx
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: params,
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buffer.as_entire_binding(),
        }];
        entries.extend(inputs.iter().map(|(binding, buf)| wgpu::BindGroupEntry {
            binding: *binding,
            resource: buf.buffer().as_entire_binding(),
        }));
        entries.push(wgpu::BindGroupEntry {
            binding: output_binding,
            resource: result.buffer().as_entire_binding(),
        });

        let bind_group_layout = pipeline.get_bind_group_layout(0);
        let bind_group = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &bind_group_layout,
            entries: &entries,
        });

        let mut encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });

        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);

            // Spill into y when x would exceed the per-dimension limit;
            // the shaders flatten (x, y) back into one index
            let groups = u32::try_from(output_len.div_ceil(WORKGROUP_SIZE as usize)).ok()?;
            let groups_x = groups.min(MAX_WORKGROUPS_PER_DIM);
            let groups_y = groups.div_ceil(groups_x);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        ctx.queue().submit(Some(encoder.finish()));
        ctx.increment_pending();
        tracing::debug!(kernel = label, output_len, "dispatched GPU kernel");

        Some(result)
    }

    /// Fused forward pass: y = deconv(x, w) + b
    pub fn deconv_forward(
        geom: &DeconvGeometryParams,
        x: &GpuBuffer,
        w: &GpuBuffer,
        bias: &GpuBuffer,
    ) -> Option<GpuBuffer> {
        debug_assert_eq!(x.len(), geom.input_len());
        debug_assert_eq!(w.len(), geom.weight_len());
        let ctx = get_gpu_context()?;
        Self::dispatch(
            &ctx.pipelines().deconv_forward,
            "Deconv Forward",
            bytemuck::bytes_of(geom),
            &[(1, x), (2, w), (3, bias)],
            4,
            geom.output_len(),
        )
    }

    /// Gradient with respect to the input, gathered per input element
    pub fn deconv_backward_input(
        geom: &DeconvGeometryParams,
        gy: &GpuBuffer,
        w: &GpuBuffer,
    ) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        Self::dispatch(
            &ctx.pipelines().deconv_backward_input,
            "Deconv Backward Input",
            bytemuck::bytes_of(geom),
            &[(1, gy), (2, w)],
            4,
            geom.input_len(),
        )
    }

    /// Gradient with respect to the weight
    pub fn deconv_backward_weight(
        geom: &DeconvGeometryParams,
        x: &GpuBuffer,
        gy: &GpuBuffer,
    ) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        Self::dispatch(
            &ctx.pipelines().deconv_backward_weight,
            "Deconv Backward Weight",
            bytemuck::bytes_of(geom),
            &[(1, x), (2, gy)],
            4,
            geom.weight_len(),
        )
    }

    /// Gradient with respect to the bias: sum of gy over batch and space
    pub fn deconv_backward_bias(geom: &DeconvGeometryParams, gy: &GpuBuffer) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        Self::dispatch(
            &ctx.pipelines().deconv_backward_bias,
            "Deconv Backward Bias",
            bytemuck::bytes_of(geom),
            &[(1, gy)],
            4,
            geom.c_out as usize,
        )
    }

    /// Unfold gy into `[batch, c_out * k_sp, in_sp]` columns
    pub fn im2col(geom: &DeconvGeometryParams, gy: &GpuBuffer) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        Self::dispatch(
            &ctx.pipelines().im2col,
            "Im2col",
            bytemuck::bytes_of(geom),
            &[(1, gy)],
            4,
            geom.cols_len(),
        )
    }

    /// Fold columns back into the output image, adding the bias
    pub fn col2im(
        geom: &DeconvGeometryParams,
        cols: &GpuBuffer,
        bias: &GpuBuffer,
    ) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        Self::dispatch(
            &ctx.pipelines().col2im,
            "Col2im",
            bytemuck::bytes_of(geom),
            &[(1, cols), (3, bias)],
            4,
            geom.output_len(),
        )
    }

    /// Batched matrix multiplication: C[b] = op(A) @ B[b]
    ///
    /// # Arguments
    /// * `a` - shared left operand, stored (m, k), or (k, m) when `trans_a`
    /// * `b` - `batch` right operands of shape (k, n), contiguous
    pub fn matmul_batched(
        a: &GpuBuffer,
        b: &GpuBuffer,
        m: usize,
        k: usize,
        n: usize,
        batch: usize,
        trans_a: bool,
    ) -> Option<GpuBuffer> {
        assert_eq!(a.len(), m * k, "A buffer size doesn't match dimensions");
        assert_eq!(b.len(), batch * k * n, "B buffer size doesn't match dimensions");
        let ctx = get_gpu_context()?;
        let params = MatMulParams {
            m: u32::try_from(m).ok()?,
            k: u32::try_from(k).ok()?,
            n: u32::try_from(n).ok()?,
            batch: u32::try_from(batch).ok()?,
            trans_a: u32::from(trans_a),
            _padding: [0; 3],
        };
        Self::dispatch(
            &ctx.pipelines().matmul,
            "MatMul Batched",
            bytemuck::bytes_of(&params),
            &[(1, a), (2, b)],
            3,
            batch * m * n,
        )
    }
}
