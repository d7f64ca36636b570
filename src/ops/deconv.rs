//! N-dimensional transposed convolution
//!
//! Layouts are row-major: x `[N, C_in, *in]`, W `[C_in, C_out, *k]`,
//! y `[N, C_out, *out]`. Input position `i` reaches output position
//! `o = i * s - p + k` through kernel tap `k`, independently per axis.

use crate::autograd::GradFn;
use crate::conv_utils::{get_conv_outsize, get_deconv_outsize};
use crate::device::Device;
use crate::error::{NdconvError, Result};
use crate::storage::Storage;
use crate::tensor::{RawTensor, Tensor};

/// Algorithm used to evaluate the deconvolution and its gradients
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeconvAlgo {
    /// Loop over kernel taps directly (fused kernels on GPU)
    #[default]
    Direct,
    /// Matrix multiplication followed by col2im
    Gemm,
}

/// Validated sizes of one deconvolution call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeconvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub in_size: Vec<usize>,
    pub out_size: Vec<usize>,
    pub ksize: Vec<usize>,
    pub stride: Vec<usize>,
    pub pad: Vec<usize>,
}

impl DeconvGeometry {
    /// Check operand shapes and resolve the output size
    ///
    /// An explicit `outsize` is accepted only when convolving it with the
    /// same kernel, stride and pad gives back the input size on every axis.
    pub fn new(
        x_shape: &[usize],
        w_shape: &[usize],
        stride: &[usize],
        pad: &[usize],
        outsize: Option<&[usize]>,
    ) -> Result<Self> {
        if x_shape.len() < 3 {
            return Err(NdconvError::InvalidParameter(format!(
                "input must be (N, C, *spatial) with at least one spatial axis, got {x_shape:?}"
            )));
        }
        let nd = x_shape.len() - 2;
        if w_shape.len() != nd + 2 {
            return Err(NdconvError::ShapeMismatch {
                op: "deconvolution_nd weight rank",
                expected: vec![nd + 2],
                actual: vec![w_shape.len()],
            });
        }
        if stride.len() != nd || pad.len() != nd {
            return Err(NdconvError::InvalidParameter(format!(
                "stride {stride:?} and pad {pad:?} must have {nd} entries"
            )));
        }
        if w_shape[0] != x_shape[1] {
            return Err(NdconvError::ShapeMismatch {
                op: "deconvolution_nd channels",
                expected: vec![w_shape[0]],
                actual: vec![x_shape[1]],
            });
        }

        let in_size = x_shape[2..].to_vec();
        let ksize = w_shape[2..].to_vec();
        let out_size = match outsize {
            Some(out) => {
                if out.len() != nd {
                    return Err(NdconvError::InvalidParameter(format!(
                        "outsize {out:?} must have {nd} entries"
                    )));
                }
                for axis in 0..nd {
                    let back = get_conv_outsize(out[axis], ksize[axis], stride[axis], pad[axis], false)?;
                    if back != in_size[axis] {
                        return Err(NdconvError::InvalidParameter(format!(
                            "outsize {} on axis {axis} is inconsistent with input size {}",
                            out[axis], in_size[axis]
                        )));
                    }
                }
                out.to_vec()
            }
            None => (0..nd)
                .map(|axis| {
                    get_deconv_outsize(in_size[axis], ksize[axis], stride[axis], pad[axis], false)
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(DeconvGeometry {
            batch: x_shape[0],
            in_channels: x_shape[1],
            out_channels: w_shape[1],
            in_size,
            out_size,
            ksize,
            stride: stride.to_vec(),
            pad: pad.to_vec(),
        })
    }

    pub fn ndim(&self) -> usize {
        self.in_size.len()
    }

    pub fn in_spatial(&self) -> usize {
        self.in_size.iter().product()
    }

    pub fn out_spatial(&self) -> usize {
        self.out_size.iter().product()
    }

    pub fn kernel_spatial(&self) -> usize {
        self.ksize.iter().product()
    }

    /// Shape of the output tensor
    pub fn output_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.batch, self.out_channels];
        shape.extend_from_slice(&self.out_size);
        shape
    }

    /// Every `(i, k, o)` triple of flat spatial indices with
    /// `o = i * s - p + k` inside the output on all axes
    fn taps(&self) -> Vec<Tap> {
        let mut taps = vec![Tap { i: 0, k: 0, o: 0 }];
        for axis in 0..self.ndim() {
            let (n_in, n_k, n_out) = (self.in_size[axis], self.ksize[axis], self.out_size[axis]);
            let (s, p) = (self.stride[axis], self.pad[axis]);
            let mut axis_taps = Vec::new();
            for i in 0..n_in {
                for k in 0..n_k {
                    let Some(o) = (i * s + k).checked_sub(p) else {
                        continue;
                    };
                    if o < n_out {
                        axis_taps.push((i, k, o));
                    }
                }
            }
            taps = taps
                .iter()
                .flat_map(|t| {
                    axis_taps.iter().map(move |&(i, k, o)| Tap {
                        i: t.i * n_in + i,
                        k: t.k * n_k + k,
                        o: t.o * n_out + o,
                    })
                })
                .collect();
        }
        taps
    }
}

#[derive(Debug, Clone, Copy)]
struct Tap {
    i: usize,
    k: usize,
    o: usize,
}

// ===== CPU: DIRECT =====

fn forward_direct(geom: &DeconvGeometry, x: &[f32], w: &[f32], b: Option<&[f32]>) -> Vec<f32> {
    let (c_in, c_out) = (geom.in_channels, geom.out_channels);
    let (in_sp, out_sp, k_sp) = (geom.in_spatial(), geom.out_spatial(), geom.kernel_spatial());
    let taps = geom.taps();

    let mut y = vec![0.0f64; geom.batch * c_out * out_sp];
    for n in 0..geom.batch {
        for co in 0..c_out {
            let y_base = (n * c_out + co) * out_sp;
            if let Some(b) = b {
                y[y_base..y_base + out_sp].fill(f64::from(b[co]));
            }
            for ci in 0..c_in {
                let x_base = (n * c_in + ci) * in_sp;
                let w_base = (ci * c_out + co) * k_sp;
                for tap in &taps {
                    y[y_base + tap.o] += f64::from(x[x_base + tap.i]) * f64::from(w[w_base + tap.k]);
                }
            }
        }
    }
    y.into_iter().map(|v| v as f32).collect()
}

fn backward_input_direct(geom: &DeconvGeometry, gy: &[f32], w: &[f32]) -> Vec<f32> {
    let (c_in, c_out) = (geom.in_channels, geom.out_channels);
    let (in_sp, out_sp, k_sp) = (geom.in_spatial(), geom.out_spatial(), geom.kernel_spatial());
    let taps = geom.taps();

    let mut gx = vec![0.0f64; geom.batch * c_in * in_sp];
    for n in 0..geom.batch {
        for ci in 0..c_in {
            let x_base = (n * c_in + ci) * in_sp;
            for co in 0..c_out {
                let y_base = (n * c_out + co) * out_sp;
                let w_base = (ci * c_out + co) * k_sp;
                for tap in &taps {
                    gx[x_base + tap.i] += f64::from(gy[y_base + tap.o]) * f64::from(w[w_base + tap.k]);
                }
            }
        }
    }
    gx.into_iter().map(|v| v as f32).collect()
}

fn backward_weight_direct(geom: &DeconvGeometry, x: &[f32], gy: &[f32]) -> Vec<f32> {
    let (c_in, c_out) = (geom.in_channels, geom.out_channels);
    let (in_sp, out_sp, k_sp) = (geom.in_spatial(), geom.out_spatial(), geom.kernel_spatial());
    let taps = geom.taps();

    let mut gw = vec![0.0f64; c_in * c_out * k_sp];
    for n in 0..geom.batch {
        for ci in 0..c_in {
            let x_base = (n * c_in + ci) * in_sp;
            for co in 0..c_out {
                let y_base = (n * c_out + co) * out_sp;
                let w_base = (ci * c_out + co) * k_sp;
                for tap in &taps {
                    gw[w_base + tap.k] += f64::from(x[x_base + tap.i]) * f64::from(gy[y_base + tap.o]);
                }
            }
        }
    }
    gw.into_iter().map(|v| v as f32).collect()
}

fn backward_bias(geom: &DeconvGeometry, gy: &[f32]) -> Vec<f32> {
    let out_sp = geom.out_spatial();
    (0..geom.out_channels)
        .map(|co| {
            let total: f64 = (0..geom.batch)
                .flat_map(|n| {
                    let base = (n * geom.out_channels + co) * out_sp;
                    gy[base..base + out_sp].iter().map(|&v| f64::from(v))
                })
                .sum();
            total as f32
        })
        .collect()
}

// ===== CPU: GEMM =====

/// `c += op(a) @ op(b)` for row-major `op(a): m x k` and `op(b): k x n`
#[allow(clippy::too_many_arguments)]
fn gemm(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    trans_a: bool,
    trans_b: bool,
) {
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f32;
            for kk in 0..k {
                let a_val = if trans_a { a[kk * m + row] } else { a[row * k + kk] };
                let b_val = if trans_b { b[col * k + kk] } else { b[kk * n + col] };
                acc += a_val * b_val;
            }
            c[row * n + col] += acc;
        }
    }
}

/// Unfold gy into `[N, C_out * k_sp, in_sp]` columns
fn im2col(geom: &DeconvGeometry, gy: &[f32]) -> Vec<f32> {
    let (c_out, in_sp, out_sp, k_sp) = (
        geom.out_channels,
        geom.in_spatial(),
        geom.out_spatial(),
        geom.kernel_spatial(),
    );
    let rows = c_out * k_sp;
    let mut cols = vec![0.0; geom.batch * rows * in_sp];
    let taps = geom.taps();
    for n in 0..geom.batch {
        for co in 0..c_out {
            let y_base = (n * c_out + co) * out_sp;
            for tap in &taps {
                cols[(n * rows + co * k_sp + tap.k) * in_sp + tap.i] = gy[y_base + tap.o];
            }
        }
    }
    cols
}

/// Fold `[N, C_out * k_sp, in_sp]` columns into the output image
fn col2im(geom: &DeconvGeometry, cols: &[f32], b: Option<&[f32]>) -> Vec<f32> {
    let (c_out, in_sp, out_sp, k_sp) = (
        geom.out_channels,
        geom.in_spatial(),
        geom.out_spatial(),
        geom.kernel_spatial(),
    );
    let rows = c_out * k_sp;
    let mut y = vec![0.0; geom.batch * c_out * out_sp];
    let taps = geom.taps();
    for n in 0..geom.batch {
        for co in 0..c_out {
            let y_base = (n * c_out + co) * out_sp;
            if let Some(b) = b {
                y[y_base..y_base + out_sp].fill(b[co]);
            }
            for tap in &taps {
                y[y_base + tap.o] += cols[(n * rows + co * k_sp + tap.k) * in_sp + tap.i];
            }
        }
    }
    y
}

fn forward_gemm(geom: &DeconvGeometry, x: &[f32], w: &[f32], b: Option<&[f32]>) -> Vec<f32> {
    let (c_in, in_sp) = (geom.in_channels, geom.in_spatial());
    let rows = geom.out_channels * geom.kernel_spatial();
    let mut cols = vec![0.0; geom.batch * rows * in_sp];
    // W is stored (C_in, C_out * k_sp), so cols[n] = W^T @ x[n]
    for n in 0..geom.batch {
        gemm(
            w,
            &x[n * c_in * in_sp..(n + 1) * c_in * in_sp],
            &mut cols[n * rows * in_sp..(n + 1) * rows * in_sp],
            rows,
            c_in,
            in_sp,
            true,
            false,
        );
    }
    col2im(geom, &cols, b)
}

fn backward_gemm(geom: &DeconvGeometry, x: &[f32], w: &[f32], gy: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let (c_in, in_sp) = (geom.in_channels, geom.in_spatial());
    let rows = geom.out_channels * geom.kernel_spatial();
    let cols = im2col(geom, gy);

    let mut gx = vec![0.0; geom.batch * c_in * in_sp];
    let mut gw = vec![0.0; c_in * rows];
    for n in 0..geom.batch {
        let cols_n = &cols[n * rows * in_sp..(n + 1) * rows * in_sp];
        gemm(
            w,
            cols_n,
            &mut gx[n * c_in * in_sp..(n + 1) * c_in * in_sp],
            c_in,
            rows,
            in_sp,
            false,
            false,
        );
        gemm(
            &x[n * c_in * in_sp..(n + 1) * c_in * in_sp],
            cols_n,
            &mut gw,
            c_in,
            in_sp,
            rows,
            false,
            true,
        );
    }
    (gx, gw)
}

// ===== DISPATCH =====

/// Operands resolved to a single device
struct Placement {
    device: Device,
    on_gpu: bool,
}

fn placement(x: &RawTensor, w: &RawTensor, b: Option<&RawTensor>) -> Result<Placement> {
    let device = x.device.clone();
    for (name, other) in [("W", Some(w)), ("b", b)] {
        if let Some(other) = other
            && !other.device.same_backend(&device)
        {
            return Err(NdconvError::DeviceError(format!(
                "deconvolution_nd operands on different devices: x on {device}, {name} on {}",
                other.device
            )));
        }
    }
    let on_gpu = device.is_gpu()
        && x.data.is_gpu()
        && w.data.is_gpu()
        && b.is_none_or(|b| b.data.is_gpu());
    Ok(Placement { device, on_gpu })
}

fn forward_storage(
    geom: &DeconvGeometry,
    x: &Storage,
    w: &Storage,
    b: Option<&Storage>,
    algo: DeconvAlgo,
    placement: &Placement,
) -> Result<Storage> {
    if placement.on_gpu {
        return gpu_forward(geom, x, w, b, algo);
    }
    let b_slice = b.map(Storage::as_slice);
    let y = match algo {
        DeconvAlgo::Direct => forward_direct(geom, x.as_slice(), w.as_slice(), b_slice),
        DeconvAlgo::Gemm => forward_gemm(geom, x.as_slice(), w.as_slice(), b_slice),
    };
    Storage::cpu(y).to_device(&placement.device)
}

#[cfg(feature = "gpu")]
fn gpu_forward(
    geom: &DeconvGeometry,
    x: &Storage,
    w: &Storage,
    b: Option<&Storage>,
    algo: DeconvAlgo,
) -> Result<Storage> {
    RawTensor::gpu_deconv_forward(geom, x, w, b, algo)
}

#[cfg(not(feature = "gpu"))]
fn gpu_forward(
    _geom: &DeconvGeometry,
    _x: &Storage,
    _w: &Storage,
    _b: Option<&Storage>,
    _algo: DeconvAlgo,
) -> Result<Storage> {
    Err(NdconvError::DeviceError("built without the gpu feature".to_string()))
}

/// Gradients of x, W and (when present) b
struct DeconvGrads {
    gx: Storage,
    gw: Storage,
    gb: Option<Storage>,
}

#[cfg(feature = "gpu")]
fn gpu_backward(
    geom: &DeconvGeometry,
    x: &Storage,
    w: &Storage,
    gy: &Storage,
    has_bias: bool,
    algo: DeconvAlgo,
) -> Result<DeconvGrads> {
    let (gx, gw, gb) = RawTensor::gpu_deconv_backward(geom, x, w, gy, has_bias, algo)?;
    Ok(DeconvGrads { gx, gw, gb })
}

#[cfg(not(feature = "gpu"))]
fn gpu_backward(
    _geom: &DeconvGeometry,
    _x: &Storage,
    _w: &Storage,
    _gy: &Storage,
    _has_bias: bool,
    _algo: DeconvAlgo,
) -> Result<DeconvGrads> {
    Err(NdconvError::DeviceError("built without the gpu feature".to_string()))
}

fn backward_storage(
    geom: &DeconvGeometry,
    x: &Storage,
    w: &Storage,
    gy: &Storage,
    has_bias: bool,
    algo: DeconvAlgo,
    placement: &Placement,
) -> Result<DeconvGrads> {
    if placement.on_gpu && gy.is_gpu() {
        return gpu_backward(geom, x, w, gy, has_bias, algo);
    }
    let (x, w, gy) = (x.as_slice(), w.as_slice(), gy.as_slice());
    let (gx, gw) = match algo {
        DeconvAlgo::Direct => (backward_input_direct(geom, gy, w), backward_weight_direct(geom, x, gy)),
        DeconvAlgo::Gemm => backward_gemm(geom, x, w, gy),
    };
    let device = &placement.device;
    Ok(DeconvGrads {
        gx: Storage::cpu(gx).to_device(device)?,
        gw: Storage::cpu(gw).to_device(device)?,
        gb: has_bias
            .then(|| Storage::cpu(backward_bias(geom, gy)).to_device(device))
            .transpose()?,
    })
}

// ===== AUTOGRAD =====

/// Gradient function for [`deconvolution_nd`]
///
/// Parents are `[x, W]` or `[x, W, b]`.
#[derive(Clone)]
pub struct DeconvGradFn {
    geom: DeconvGeometry,
    algo: DeconvAlgo,
}

impl GradFn for DeconvGradFn {
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Result<Vec<Option<Tensor>>> {
        let has_bias = parents.len() == 3;
        let (x_ref, w_ref) = (parents[0].borrow(), parents[1].borrow());
        let b_ref = parents.get(2).map(|b| b.borrow());
        let placement = placement(&x_ref, &w_ref, b_ref.as_deref())?;

        if out_grad.shape != self.geom.output_shape() {
            return Err(NdconvError::ShapeMismatch {
                op: "deconvolution_nd backward",
                expected: self.geom.output_shape(),
                actual: out_grad.shape.clone(),
            });
        }

        let grads = backward_storage(
            &self.geom,
            &x_ref.data,
            &w_ref.data,
            &out_grad.data,
            has_bias,
            self.algo,
            &placement,
        )?;

        let device = placement.device;
        let mut out = vec![
            Some(RawTensor::from_storage(grads.gx, &x_ref.shape, device.clone(), false)),
            Some(RawTensor::from_storage(grads.gw, &w_ref.shape, device.clone(), false)),
        ];
        if let (Some(gb), Some(b_ref)) = (grads.gb, b_ref.as_deref()) {
            out.push(Some(RawTensor::from_storage(gb, &b_ref.shape, device, false)));
        }
        Ok(out)
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

/// N-dimensional transposed convolution
///
/// # Arguments
/// * `x` - input `(N, C_in, *in)`
/// * `w` - weight `(C_in, C_out, *k)`
/// * `b` - optional bias `(C_out,)`
/// * `stride`, `pad` - one entry per spatial axis
/// * `outsize` - explicit output size; must be consistent with the input
/// * `algo` - evaluation strategy; both give the same result up to rounding
///
/// All operands must be on the same device. The result lives there too.
pub fn deconvolution_nd(
    x: &Tensor,
    w: &Tensor,
    b: Option<&Tensor>,
    stride: &[usize],
    pad: &[usize],
    outsize: Option<&[usize]>,
    algo: DeconvAlgo,
) -> Result<Tensor> {
    let (geom, data, device, requires_grad) = {
        let x_ref = x.borrow();
        let w_ref = w.borrow();
        let b_ref = b.map(|b| b.borrow());
        let geom = DeconvGeometry::new(&x_ref.shape, &w_ref.shape, stride, pad, outsize)?;
        if let Some(b_ref) = b_ref.as_deref()
            && b_ref.shape != [geom.out_channels]
        {
            return Err(NdconvError::ShapeMismatch {
                op: "deconvolution_nd bias",
                expected: vec![geom.out_channels],
                actual: b_ref.shape.clone(),
            });
        }
        let placement = placement(&x_ref, &w_ref, b_ref.as_deref())?;
        let data = forward_storage(
            &geom,
            &x_ref.data,
            &w_ref.data,
            b_ref.as_deref().map(|b| &b.data),
            algo,
            &placement,
        )?;
        let requires_grad = x_ref.requires_grad
            || w_ref.requires_grad
            || b_ref.as_deref().is_some_and(|b| b.requires_grad);
        (geom, data, placement.device, requires_grad)
    };

    let out = RawTensor::from_storage(data, &geom.output_shape(), device, requires_grad);
    if requires_grad {
        let mut o = out.borrow_mut();
        o.parents = vec![x.clone(), w.clone()];
        if let Some(b) = b {
            o.parents.push(b.clone());
        }
        o.grad_fn = Some(Box::new(DeconvGradFn { geom, algo }));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorOps;

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-5 + 1e-4 * y.abs())
    }

    #[test]
    fn one_dimensional_by_hand() {
        // x = [1, 2, 3], w = [1, 10, 100], s = 2, p = 1 -> out = 5
        let x = RawTensor::new(vec![1.0, 2.0, 3.0], &[1, 1, 3], false);
        let w = RawTensor::new(vec![1.0, 10.0, 100.0], &[1, 1, 3], false);
        let b = RawTensor::new(vec![0.5], &[1], false);
        let y = deconvolution_nd(&x, &w, Some(&b), &[2], &[1], None, DeconvAlgo::Direct).unwrap();
        assert_eq!(y.shape(), vec![1, 1, 5]);
        // full (unpadded) output: [1, 10, 102, 20, 203, 30, 300], crop one on each side
        assert_eq!(y.to_vec(), vec![10.5, 102.5, 20.5, 203.5, 30.5]);
    }

    #[test]
    fn direct_and_gemm_agree() {
        let x = RawTensor::uniform(&[2, 3, 4, 3], -1.0, 1.0);
        let w = RawTensor::uniform(&[3, 2, 3, 3], -1.0, 1.0);
        let b = RawTensor::uniform(&[2], -1.0, 1.0);
        let direct = deconvolution_nd(&x, &w, Some(&b), &[2, 2], &[1, 1], None, DeconvAlgo::Direct).unwrap();
        let gemm = deconvolution_nd(&x, &w, Some(&b), &[2, 2], &[1, 1], None, DeconvAlgo::Gemm).unwrap();
        assert_eq!(direct.shape(), vec![2, 2, 7, 5]);
        assert!(close(&direct.to_vec(), &gemm.to_vec()));
    }

    #[test]
    fn gradients_agree_between_algorithms() {
        let run = |algo| {
            let x = RawTensor::new((0..24).map(|v| (v as f32 * 0.37).sin()).collect(), &[2, 3, 4], true);
            let w = RawTensor::new((0..18).map(|v| (v as f32 * 0.11).cos()).collect(), &[3, 2, 3], true);
            let b = RawTensor::new(vec![0.1, -0.2], &[2], true);
            let y = deconvolution_nd(&x, &w, Some(&b), &[2], &[1], None, algo).unwrap();
            let gy = RawTensor::new((0..28).map(|v| (v as f32 * 0.5).cos()).collect(), &[2, 2, 7], false);
            y.backward_with_grad(&gy).unwrap();
            (x.grad().unwrap(), w.grad().unwrap(), b.grad().unwrap())
        };
        let (gx_d, gw_d, gb_d) = run(DeconvAlgo::Direct);
        let (gx_g, gw_g, gb_g) = run(DeconvAlgo::Gemm);
        assert!(close(&gx_d, &gx_g));
        assert!(close(&gw_d, &gw_g));
        assert!(close(&gb_d, &gb_g));
    }

    #[test]
    fn bias_gradient_sums_over_batch_and_space() {
        let x = RawTensor::zeros(&[2, 1, 3]);
        let w = RawTensor::zeros(&[1, 2, 3]);
        let b = RawTensor::new(vec![0.0, 0.0], &[2], true);
        let y = deconvolution_nd(&x, &w, Some(&b), &[2], &[1], None, DeconvAlgo::Direct).unwrap();
        y.backward_with_grad(&RawTensor::ones(&[2, 2, 5])).unwrap();
        assert_eq!(b.grad().unwrap(), vec![10.0, 10.0]);
    }

    #[test]
    fn explicit_outsize_must_invert_to_input() {
        let x = RawTensor::zeros(&[1, 1, 3]);
        let w = RawTensor::zeros(&[1, 1, 3]);
        assert!(deconvolution_nd(&x, &w, None, &[2], &[1], Some(&[5][..]), DeconvAlgo::Direct).is_ok());
        // conv_outsize(6, 3, 2, 1) = 3, so 6 is also consistent
        let y = deconvolution_nd(&x, &w, None, &[2], &[1], Some(&[6][..]), DeconvAlgo::Direct).unwrap();
        assert_eq!(y.shape(), vec![1, 1, 6]);
        let err = deconvolution_nd(&x, &w, None, &[2], &[1], Some(&[8][..]), DeconvAlgo::Direct).unwrap_err();
        assert!(matches!(err, NdconvError::InvalidParameter(_)));
    }

    #[test]
    fn rejects_mismatched_operands() {
        let x = RawTensor::zeros(&[1, 3, 4]);
        let w_bad_ch = RawTensor::zeros(&[2, 2, 3]);
        assert!(deconvolution_nd(&x, &w_bad_ch, None, &[1], &[0], None, DeconvAlgo::Direct).is_err());

        let w = RawTensor::zeros(&[3, 2, 3]);
        assert!(deconvolution_nd(&x, &w, None, &[1, 1], &[0], None, DeconvAlgo::Direct).is_err());

        let b_bad = RawTensor::zeros(&[3]);
        assert!(deconvolution_nd(&x, &w, Some(&b_bad), &[1], &[0], None, DeconvAlgo::Direct).is_err());

        let w_2d = RawTensor::zeros(&[3, 2, 3, 3]);
        assert!(deconvolution_nd(&x, &w_2d, None, &[1], &[0], None, DeconvAlgo::Direct).is_err());
    }

    #[test]
    fn rejects_operands_on_different_devices() {
        let x = RawTensor::zeros(&[1, 1, 3]);
        let w = RawTensor::zeros(&[1, 1, 3]);
        w.borrow_mut().device = Device::GPU("elsewhere".to_string());
        let err = deconvolution_nd(&x, &w, None, &[1], &[0], None, DeconvAlgo::Direct).unwrap_err();
        assert!(matches!(err, NdconvError::DeviceError(_)));
    }

    #[test]
    fn output_without_grad_inputs_is_a_leaf() {
        let x = RawTensor::zeros(&[1, 1, 2]);
        let w = RawTensor::zeros(&[1, 1, 2]);
        let y = deconvolution_nd(&x, &w, None, &[1], &[0], None, DeconvAlgo::Gemm).unwrap();
        assert!(!y.borrow().requires_grad);
        assert!(y.borrow().grad_fn.is_none());
    }
}
