//! Parameter initializers
//!
//! Fan sizes follow the usual convention for convolution weights of shape
//! `(a, b, *k)`: `fan_in = b * prod(k)` and `fan_out = a * prod(k)`.

use crate::error::{NdconvError, Result};
use crate::tensor::{RawTensor, Tensor};
use rand::Rng;

/// How to fill a freshly created parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    /// Every element set to the value
    Constant(f32),
    /// Uniform in `[-scale, scale]`
    Uniform { scale: f32 },
    /// Normal with standard deviation `scale`, which must not be negative
    Normal { scale: f32 },
    /// Normal with standard deviation `scale * sqrt(1 / fan_in)`
    LeCunNormal { scale: f32 },
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::LeCunNormal { scale: 1.0 }
    }
}

/// `(fan_in, fan_out)` for a parameter shape
pub fn get_fans(shape: &[usize]) -> Result<(usize, usize)> {
    if shape.len() < 2 {
        return Err(NdconvError::InvalidParameter(format!(
            "fan computation needs at least 2 dims, got {shape:?}"
        )));
    }
    let receptive: usize = shape[2..].iter().product();
    Ok((shape[1] * receptive, shape[0] * receptive))
}

impl Initializer {
    /// Create a tensor of `shape` using the thread-local generator
    pub fn initialize(&self, shape: &[usize]) -> Result<Tensor> {
        self.initialize_with_rng(shape, &mut rand::rng())
    }

    pub fn initialize_with_rng<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Result<Tensor> {
        let size: usize = shape.iter().product();
        let t = match *self {
            Initializer::Constant(value) => RawTensor::new(vec![value; size], shape, false),
            Initializer::Uniform { scale } => {
                let scale = scale.abs();
                if !scale.is_finite() {
                    return Err(NdconvError::InvalidParameter(format!(
                        "uniform scale must be finite, got {scale}"
                    )));
                }
                RawTensor::uniform_with_rng(shape, -scale, scale, rng)
            }
            Initializer::Normal { scale } => RawTensor::randn_scaled(shape, scale, rng)?,
            Initializer::LeCunNormal { scale } => {
                let (fan_in, _) = get_fans(shape)?;
                let std = scale * (1.0 / fan_in.max(1) as f32).sqrt();
                RawTensor::randn_scaled(shape, std, rng)?
            }
        };
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorOps;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn fans_for_deconv_weight() {
        // (in_channels, out_channels, 3, 3, 3)
        assert_eq!(get_fans(&[3, 2, 3, 3, 3]).unwrap(), (54, 81));
        assert!(get_fans(&[5]).is_err());
    }

    #[test]
    fn constant_fills_every_element() {
        let t = Initializer::Constant(0.5).initialize(&[2, 3]).unwrap();
        assert!(t.to_vec().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn uniform_respects_scale() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = Initializer::Uniform { scale: 1.0 }
            .initialize_with_rng(&[64], &mut rng)
            .unwrap();
        assert!(t.to_vec().iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn normal_rejects_invalid_scale() {
        for scale in [-1.0, f32::NAN] {
            let err = Initializer::Normal { scale }.initialize(&[3, 2, 3]).unwrap_err();
            assert!(matches!(err, NdconvError::InvalidParameter(_)), "scale {scale}");
            assert!(Initializer::LeCunNormal { scale }.initialize(&[3, 2, 3]).is_err());
        }
    }

    #[test]
    fn lecun_normal_shrinks_with_fan_in() {
        let mut rng = StdRng::seed_from_u64(11);
        let t = Initializer::default()
            .initialize_with_rng(&[16, 32, 3, 3], &mut rng)
            .unwrap();
        let data = t.to_vec();
        let var = data.iter().map(|v| v * v).sum::<f32>() / data.len() as f32;
        // target variance 1 / (32 * 9)
        assert!((var - 1.0 / 288.0).abs() < 1e-3, "variance {var}");
    }
}
