//! Helpers for verifying layers: tolerance comparison, retries,
//! configuration products and GPU gating

use crate::conv_utils::deconv_outsizes;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::NdconvError;
use crate::initializers::Initializer;
use crate::nn::DeconvolutionND;
use crate::tensor::{RawTensor, Tensor};
use rand::Rng;
use std::fmt;
use thiserror::Error;

/// Default absolute tolerance of [`allclose_default`]
pub const DEFAULT_ATOL: f32 = 1e-5;
/// Default relative tolerance of [`allclose_default`]
pub const DEFAULT_RTOL: f32 = 1e-4;

/// Failure of a verification check
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("dtype changed: expected {expected}, got {actual}")]
    DTypeChanged { expected: DType, actual: DType },

    #[error(
        "values differ at index {index}: got {actual}, expected {expected} \
         (max error {max_err}, atol {atol}, rtol {rtol})"
    )]
    ValueMismatch {
        index: usize,
        actual: f32,
        expected: f32,
        max_err: f32,
        atol: f32,
        rtol: f32,
    },

    #[error(
        "gradient of array {array} differs at index {index}: analytic {analytic}, \
         numerical {numerical} (max error {max_err})"
    )]
    GradientMismatch {
        array: usize,
        index: usize,
        analytic: f32,
        numerical: f32,
        max_err: f32,
    },

    #[error("array {array} received no gradient")]
    MissingGradient { array: usize },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Op(#[from] NdconvError),
}

/// First element outside `atol + rtol * |expected|`, with the largest
/// absolute error over all elements
pub(crate) fn first_mismatch(
    actual: &[f32],
    expected: &[f32],
    atol: f32,
    rtol: f32,
) -> Option<(usize, f32)> {
    let mut first = None;
    let mut max_err = 0.0f32;
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let err = (a - e).abs();
        // NaN never passes
        let ok = err <= atol + rtol * e.abs();
        if !ok && first.is_none() {
            first = Some(i);
        }
        if err > max_err || err.is_nan() {
            max_err = err;
        }
    }
    first.map(|i| (i, max_err))
}

/// Elementwise `|actual - expected| <= atol + rtol * |expected|`
pub fn assert_allclose(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> Result<(), CheckError> {
    if actual.len() != expected.len() {
        return Err(CheckError::Shape {
            expected: vec![expected.len()],
            actual: vec![actual.len()],
        });
    }
    match first_mismatch(actual, expected, atol, rtol) {
        None => Ok(()),
        Some((index, max_err)) => Err(CheckError::ValueMismatch {
            index,
            actual: actual[index],
            expected: expected[index],
            max_err,
            atol,
            rtol,
        }),
    }
}

/// [`assert_allclose`] with `atol = 1e-5`, `rtol = 1e-4`
pub fn allclose_default(actual: &[f32], expected: &[f32]) -> Result<(), CheckError> {
    assert_allclose(actual, expected, DEFAULT_ATOL, DEFAULT_RTOL)
}

/// Run `f` up to `times` times, stopping at the first success
///
/// Failed attempts are logged. If every attempt fails the last error is
/// returned.
pub fn retry<T, F>(times: usize, mut f: F) -> Result<T, CheckError>
where
    F: FnMut() -> Result<T, CheckError>,
{
    let attempts = times.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                tracing::warn!(attempt, attempts, error = %e, "check failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The GPU device when one is usable, else None
///
/// GPU tests return early on None so they count as skipped on machines
/// without an adapter or builds without the `gpu` feature.
pub fn gpu_device() -> Option<Device> {
    let device = Device::gpu();
    if device.is_none() {
        tracing::info!("no GPU available, skipping GPU check");
    }
    device
}

/// One configuration of the deconvolution harness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeconvCase {
    pub dims: Vec<usize>,
    pub nobias: bool,
    pub dtype: DType,
    pub fast_path: bool,
    pub use_outsize: bool,
}

impl fmt::Display for DeconvCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dims={:?} nobias={} dtype={} fast_path={} use_outsize={}",
            self.dims, self.nobias, self.dtype, self.fast_path, self.use_outsize
        )
    }
}

/// Cross product of the configuration axes
///
/// Order is dims-major, then nobias, fast path and outsize.
pub fn product(
    dims: &[&[usize]],
    nobias: &[bool],
    fast_path: &[bool],
    use_outsize: &[bool],
) -> Vec<DeconvCase> {
    let mut cases = Vec::with_capacity(dims.len() * nobias.len() * fast_path.len() * use_outsize.len());
    for d in dims {
        for &nb in nobias {
            for &fast in fast_path {
                for &outsize in use_outsize {
                    cases.push(DeconvCase {
                        dims: d.to_vec(),
                        nobias: nb,
                        dtype: DType::F32,
                        fast_path: fast,
                        use_outsize: outsize,
                    });
                }
            }
        }
    }
    cases
}

/// Tensors for one harness run
pub struct DeconvFixture {
    pub link: DeconvolutionND,
    pub x: Tensor,
    pub gy: Tensor,
}

impl DeconvCase {
    pub const BATCH: usize = 2;
    pub const IN_CHANNELS: usize = 3;
    pub const OUT_CHANNELS: usize = 2;
    pub const KSIZE: usize = 3;
    pub const STRIDE: usize = 2;
    pub const PAD: usize = 1;

    /// Output spatial size for this case's input dims
    pub fn outs(&self) -> Result<Vec<usize>, NdconvError> {
        let nd = self.dims.len();
        deconv_outsizes(
            &self.dims,
            &vec![Self::KSIZE; nd],
            &vec![Self::STRIDE; nd],
            &vec![Self::PAD; nd],
        )
    }

    /// Build the layer, input and output gradient on the CPU
    ///
    /// x and gy are uniform in `[-1, 1]`; the bias, when present, is
    /// uniform with scale 1.
    pub fn fixture(&self) -> Result<DeconvFixture, NdconvError> {
        self.fixture_with_rng(&mut rand::rng())
    }

    pub fn fixture_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<DeconvFixture, NdconvError> {
        if self.dtype != DType::F32 {
            return Err(NdconvError::DTypeMismatch {
                expected: DType::F32,
                actual: self.dtype,
            });
        }
        let nd = self.dims.len();
        let outs = self.outs()?;
        let initial_bias = (!self.nobias).then_some(Initializer::Uniform { scale: 1.0 });
        let mut link = DeconvolutionND::new(
            nd,
            Self::IN_CHANNELS,
            Self::OUT_CHANNELS,
            Self::KSIZE,
            Self::STRIDE,
            Self::PAD,
            self.use_outsize.then_some(outs.as_slice()),
            None,
            initial_bias,
        )?;
        link.set_fast_path(self.fast_path);

        let mut x_shape = vec![Self::BATCH, Self::IN_CHANNELS];
        x_shape.extend_from_slice(&self.dims);
        let mut gy_shape = vec![Self::BATCH, Self::OUT_CHANNELS];
        gy_shape.extend_from_slice(&outs);

        Ok(DeconvFixture {
            link,
            x: RawTensor::uniform_with_rng(&x_shape, -1.0, 1.0, rng),
            gy: RawTensor::uniform_with_rng(&gy_shape, -1.0, 1.0, rng),
        })
    }
}
