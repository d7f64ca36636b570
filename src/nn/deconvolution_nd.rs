use crate::error::{NdconvError, Result};
use crate::initializers::Initializer;
use crate::io::{StateDict, TensorData};
use crate::nn::Module;
use crate::ops::{DeconvAlgo, deconvolution_nd};
use crate::storage::Storage;
use crate::tensor::Tensor;

/// A per-axis size given either once for every axis or axis by axis
pub trait IntoNd {
    fn into_nd(self, ndim: usize) -> Result<Vec<usize>>;
}

impl IntoNd for usize {
    fn into_nd(self, ndim: usize) -> Result<Vec<usize>> {
        Ok(vec![self; ndim])
    }
}

impl IntoNd for &[usize] {
    fn into_nd(self, ndim: usize) -> Result<Vec<usize>> {
        if self.len() != ndim {
            return Err(NdconvError::InvalidParameter(format!(
                "expected {ndim} values, got {self:?}"
            )));
        }
        Ok(self.to_vec())
    }
}

impl<const N: usize> IntoNd for [usize; N] {
    fn into_nd(self, ndim: usize) -> Result<Vec<usize>> {
        self.as_slice().into_nd(ndim)
    }
}

impl IntoNd for Vec<usize> {
    fn into_nd(self, ndim: usize) -> Result<Vec<usize>> {
        self.as_slice().into_nd(ndim)
    }
}

/// N-dimensional transposed convolution layer
///
/// Holds `W` of shape `(in_channels, out_channels, *ksize)` and an optional
/// bias of shape `(out_channels,)`.
///
/// The fast path (on by default) evaluates the kernel taps directly, which
/// on the GPU is a single fused kernel. With it off the layer goes through
/// a matrix multiplication and col2im instead.
pub struct DeconvolutionND {
    w: Tensor,
    b: Option<Tensor>,
    stride: Vec<usize>,
    pad: Vec<usize>,
    outsize: Option<Vec<usize>>,
    fast_path: bool,
}

impl DeconvolutionND {
    /// Create a layer with `ndim` spatial axes
    ///
    /// `initial_w` defaults to LeCun normal. `initial_bias = None` builds a
    /// layer without bias.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ndim: usize,
        in_channels: usize,
        out_channels: usize,
        ksize: impl IntoNd,
        stride: impl IntoNd,
        pad: impl IntoNd,
        outsize: Option<&[usize]>,
        initial_w: Option<Initializer>,
        initial_bias: Option<Initializer>,
    ) -> Result<Self> {
        if ndim == 0 {
            return Err(NdconvError::InvalidParameter(
                "DeconvolutionND needs at least one spatial dimension".to_string(),
            ));
        }
        let ksize = ksize.into_nd(ndim)?;
        let stride = stride.into_nd(ndim)?;
        let pad = pad.into_nd(ndim)?;
        if stride.contains(&0) {
            return Err(NdconvError::InvalidParameter(format!(
                "stride must be positive, got {stride:?}"
            )));
        }
        let outsize = outsize.map(|o| o.into_nd(ndim)).transpose()?;

        let mut w_shape = vec![in_channels, out_channels];
        w_shape.extend_from_slice(&ksize);
        let w = initial_w.unwrap_or_default().initialize(&w_shape)?;
        w.borrow_mut().requires_grad = true;

        let b = initial_bias
            .map(|init| {
                let b = init.initialize(&[out_channels])?;
                b.borrow_mut().requires_grad = true;
                Ok::<_, NdconvError>(b)
            })
            .transpose()?;

        Ok(DeconvolutionND {
            w,
            b,
            stride,
            pad,
            outsize,
            fast_path: true,
        })
    }

    /// Weight tensor
    pub fn w(&self) -> &Tensor {
        &self.w
    }

    /// Bias tensor, absent for layers built without bias
    pub fn b(&self) -> Option<&Tensor> {
        self.b.as_ref()
    }

    pub fn outsize(&self) -> Option<&[usize]> {
        self.outsize.as_deref()
    }

    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    pub fn pad(&self) -> &[usize] {
        &self.pad
    }

    pub fn set_fast_path(&mut self, enabled: bool) {
        self.fast_path = enabled;
    }

    pub fn fast_path(&self) -> bool {
        self.fast_path
    }

    fn algo(&self) -> DeconvAlgo {
        if self.fast_path {
            DeconvAlgo::Direct
        } else {
            DeconvAlgo::Gemm
        }
    }
}

/// Validate one entry against `param` and place it on the parameter's device
fn stage_param(param: &Tensor, key: &str, state: &StateDict) -> Result<Storage> {
    let Some(td) = state.get(key) else {
        return Err(NdconvError::InvalidParameter(format!(
            "state dict has no entry for '{key}'"
        )));
    };
    let t = param.borrow();
    if td.shape != t.shape || td.data.len() != t.num_elements() {
        return Err(NdconvError::ShapeMismatch {
            op: "load_state_dict",
            expected: t.shape.clone(),
            actual: td.shape.clone(),
        });
    }
    Storage::cpu(td.data.clone()).to_device(&t.device)
}

impl Module for DeconvolutionND {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        deconvolution_nd(
            x,
            &self.w,
            self.b.as_ref(),
            &self.stride,
            &self.pad,
            self.outsize.as_deref(),
            self.algo(),
        )
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.w.clone()];
        if let Some(ref b) = self.b {
            params.push(b.clone());
        }
        params
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("W".to_string(), TensorData::from_tensor(&self.w));
        if let Some(ref b) = self.b {
            state.insert("b".to_string(), TensorData::from_tensor(b));
        }
        state
    }

    /// Replace `W` (and `b`) with the entries of `state`
    ///
    /// Every entry is validated before any parameter changes, so a rejected
    /// state dict leaves the layer as it was. Keys the layer doesn't have,
    /// such as `b` for a layer without bias, are rejected.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let mut params = vec![("W", &self.w)];
        if let Some(ref b) = self.b {
            params.push(("b", b));
        }
        if let Some(key) = state.keys().find(|k| !params.iter().any(|(name, _)| *name == k.as_str())) {
            return Err(NdconvError::InvalidParameter(format!(
                "state dict entry '{key}' has no matching parameter"
            )));
        }
        let staged = params
            .iter()
            .map(|(key, param)| stage_param(param, key, state))
            .collect::<Result<Vec<_>>>()?;
        for ((_, param), data) in params.iter().zip(staged) {
            param.borrow_mut().data = data;
        }
        Ok(())
    }
}
