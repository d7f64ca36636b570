use crate::autograd::GradFn;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{NdconvError, Result};
use crate::storage::Storage;
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal, Uniform};
use std::cell::RefCell;
use std::rc::Rc;

/// Type alias for a reference-counted, interior-mutable tensor.
///
/// We use `Rc<RefCell<RawTensor>>` to allow multiple references to the same tensor
/// (needed for computation graphs) while still allowing mutation (for gradient accumulation).
pub type Tensor = Rc<RefCell<RawTensor>>;

// ===== RAW TENSOR STRUCTURE =====

/// The core tensor structure containing data and gradient tracking
///
/// Fields:
/// - `data`: values in row-major order, on the CPU or the GPU
/// - `shape`: dimensions, e.g. [batch, channels, depth, height, width]
/// - `grad`: accumulated gradient, same length and device as `data`
/// - `requires_grad`: whether to track gradients for this tensor
/// - `grad_fn`: function to compute parent gradients during backward
/// - `parents`: input tensors that this tensor depends on
/// - `device`: where computation happens
pub struct RawTensor {
    pub data: Storage,
    pub shape: Vec<usize>,
    pub grad: Option<Storage>,
    pub requires_grad: bool,
    pub grad_fn: Option<Box<dyn GradFn>>,
    pub parents: Vec<Tensor>,
    pub device: Device,
}

impl Clone for RawTensor {
    fn clone(&self) -> Self {
        RawTensor {
            data: self.data.clone(),
            shape: self.shape.clone(),
            grad: self.grad.clone(),
            requires_grad: self.requires_grad,
            grad_fn: self.grad_fn.as_ref().map(|gf| gf.clone_box()),
            parents: self.parents.clone(),
            device: self.device.clone(),
        }
    }
}

impl std::fmt::Debug for RawTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.data.dtype())
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.is_some())
            .field("device", &self.device)
            .finish()
    }
}

// ===== TENSOR CONSTRUCTORS =====
impl RawTensor {
    /// Create a new CPU tensor from data and shape
    ///
    /// # Panics
    /// Panics if data.len() != shape.product(). Use [`RawTensor::from_vec`]
    /// for a fallible version.
    pub fn new(data: Vec<f32>, shape: &[usize], requires_grad: bool) -> Tensor {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length must match shape"
        );
        Self::from_storage(Storage::cpu(data), shape, Device::CPU, requires_grad)
    }

    /// Create a new CPU tensor, reporting a length mismatch as an error
    pub fn from_vec(data: Vec<f32>, shape: &[usize], requires_grad: bool) -> Result<Tensor> {
        let elements = shape.iter().product::<usize>();
        if data.len() != elements {
            return Err(NdconvError::ShapeDataMismatch {
                shape: shape.to_vec(),
                elements,
                len: data.len(),
            });
        }
        Ok(Self::new(data, shape, requires_grad))
    }

    /// Wrap existing storage that already lives on `device`
    pub fn from_storage(
        data: Storage,
        shape: &[usize],
        device: Device,
        requires_grad: bool,
    ) -> Tensor {
        let raw = RawTensor {
            data,
            shape: shape.to_vec(),
            grad: None,
            requires_grad,
            grad_fn: None,
            parents: vec![],
            device,
        };
        Rc::new(RefCell::new(raw))
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        Self::new(vec![0.0; size], shape, false)
    }

    /// Create a tensor filled with ones
    pub fn ones(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        Self::new(vec![1.0; size], shape, false)
    }

    /// Create a tensor with values uniformly distributed in `[low, high]`
    ///
    /// # Panics
    /// Panics if `low > high` or either bound is not finite.
    pub fn uniform(shape: &[usize], low: f32, high: f32) -> Tensor {
        Self::uniform_with_rng(shape, low, high, &mut rand::rng())
    }

    /// [`RawTensor::uniform`] drawing from a caller-supplied generator
    pub fn uniform_with_rng<R: Rng + ?Sized>(
        shape: &[usize],
        low: f32,
        high: f32,
        rng: &mut R,
    ) -> Tensor {
        let size = shape.iter().product();
        let dist = Uniform::new_inclusive(low, high).expect("uniform bounds must be finite and ordered");
        let data: Vec<f32> = (0..size).map(|_| dist.sample(rng)).collect();
        Self::new(data, shape, false)
    }

    /// Create a tensor with values from the normal distribution N(0, std^2)
    ///
    /// `std` must be finite and non-negative; zero gives all zeros.
    pub fn randn_scaled<R: Rng + ?Sized>(shape: &[usize], std: f32, rng: &mut R) -> Result<Tensor> {
        if !std.is_finite() {
            return Err(NdconvError::InvalidParameter(format!(
                "normal std must be finite, got {std}"
            )));
        }
        let normal = Normal::new(0.0, std).map_err(|e| {
            NdconvError::InvalidParameter(format!("normal std {std} rejected: {e}"))
        })?;
        let size = shape.iter().product();
        let data: Vec<f32> = (0..size).map(|_| normal.sample(rng)).collect();
        Ok(Self::new(data, shape, false))
    }

    /// Create a tensor with values from standard normal distribution N(0, 1)
    pub fn randn(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        let mut rng = rand::rng();
        let data: Vec<f32> = (0..size).map(|_| StandardNormal.sample(&mut rng)).collect();
        Self::new(data, shape, false)
    }

    /// Number of elements implied by the shape
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Element type of the stored data
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

// ===== DEVICE TRANSFER =====

impl RawTensor {
    /// Copy a tensor to `device`
    ///
    /// The result is a fresh leaf with the same values and `requires_grad`
    /// flag. The graph and any stored gradient are not carried over. Fails
    /// with [`NdconvError::DeviceError`] when the device can't take the data.
    pub fn to_device(self_t: &Tensor, device: Device) -> Result<Tensor> {
        let t = self_t.borrow();
        if t.device == device {
            tracing::trace!(%device, "to_device on same device, copying");
        } else {
            tracing::debug!(from = %t.device, to = %device, shape = ?t.shape, "moving tensor");
        }
        let data = t.data.to_device(&device)?;
        Ok(Self::from_storage(data, &t.shape, device, t.requires_grad))
    }
}

// ===== SUM =====

/// Gradient for sum: broadcast the scalar gradient back to every input element
#[derive(Clone)]
struct SumGradFn {
    len: usize,
}

impl GradFn for SumGradFn {
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Result<Vec<Option<Tensor>>> {
        let g = out_grad.data.as_slice().first().copied().unwrap_or(0.0);
        let parent = &parents[0];
        let (shape, device) = {
            let p = parent.borrow();
            (p.shape.clone(), p.device.clone())
        };
        let data = Storage::cpu(vec![g; self.len]).to_device(&device)?;
        Ok(vec![Some(RawTensor::from_storage(data, &shape, device, false))])
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

impl RawTensor {
    /// Sum all elements into a tensor of shape `[1]`
    ///
    /// The reduction runs on the host mirror in f64 so both backends produce
    /// the same value.
    pub fn sum(self_t: &Tensor) -> Result<Tensor> {
        let (total, len, requires_grad, device) = {
            let s = self_t.borrow();
            let total: f64 = s.data.as_slice().iter().map(|&v| f64::from(v)).sum();
            (total as f32, s.data.len(), s.requires_grad, s.device.clone())
        };
        let data = Storage::cpu(vec![total]).to_device(&device)?;
        let out = Self::from_storage(data, &[1], device, requires_grad);
        if requires_grad {
            let mut o = out.borrow_mut();
            o.parents = vec![self_t.clone()];
            o.grad_fn = Some(Box::new(SumGradFn { len }));
        }
        Ok(out)
    }
}

// ===== TRAIT-BASED API =====

/// Public trait for tensor operations
///
/// This provides a more ergonomic API: `tensor.sum()` instead of `RawTensor::sum(&tensor)`
pub trait TensorOps {
    fn sum(&self) -> Result<Tensor>;

    fn backward(&self) -> Result<()>;
    fn backward_with_grad(&self, grad: &Tensor) -> Result<()>;
    fn grad(&self) -> Option<Vec<f32>>;
    fn zero_grad(&self);

    fn to_device(&self, device: Device) -> Result<Tensor>;
    fn device(&self) -> Device;
    fn shape(&self) -> Vec<usize>;
    fn dtype(&self) -> DType;
    fn to_vec(&self) -> Vec<f32>;
}

impl TensorOps for Tensor {
    fn sum(&self) -> Result<Tensor> {
        RawTensor::sum(self)
    }

    fn backward(&self) -> Result<()> {
        RawTensor::backward(self)
    }
    fn backward_with_grad(&self, grad: &Tensor) -> Result<()> {
        RawTensor::backward_with_grad(self, grad)
    }
    fn grad(&self) -> Option<Vec<f32>> {
        self.borrow().grad.as_ref().map(Storage::to_vec)
    }
    fn zero_grad(&self) {
        self.borrow_mut().grad = None;
    }

    fn to_device(&self, device: Device) -> Result<Tensor> {
        RawTensor::to_device(self, device)
    }
    fn device(&self) -> Device {
        self.borrow().device.clone()
    }
    fn shape(&self) -> Vec<usize> {
        self.borrow().shape.clone()
    }
    fn dtype(&self) -> DType {
        self.borrow().dtype()
    }
    fn to_vec(&self) -> Vec<f32> {
        self.borrow().data.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = RawTensor::from_vec(vec![1.0, 2.0, 3.0], &[2, 2], false).unwrap_err();
        assert!(matches!(
            err,
            NdconvError::ShapeDataMismatch {
                elements: 4,
                len: 3,
                ..
            }
        ));
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = RawTensor::uniform_with_rng(&[2, 3, 4], -1.0, 1.0, &mut rng);
        assert_eq!(t.shape(), vec![2, 3, 4]);
        assert!(t.to_vec().iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(t.dtype(), DType::F32);
    }

    #[test]
    fn randn_scaled_rejects_bad_std() {
        let mut rng = StdRng::seed_from_u64(5);
        for std in [-1.0, f32::NAN, f32::INFINITY] {
            let err = RawTensor::randn_scaled(&[4], std, &mut rng).unwrap_err();
            assert!(matches!(err, NdconvError::InvalidParameter(_)), "std {std}");
        }
        let zeros = RawTensor::randn_scaled(&[4], 0.0, &mut rng).unwrap();
        assert_eq!(zeros.to_vec(), vec![0.0; 4]);
        assert_eq!(RawTensor::randn(&[2, 3]).shape(), vec![2, 3]);
    }

    #[test]
    fn to_device_cpu_is_a_fresh_leaf() {
        let x = RawTensor::new(vec![1.0, 2.0], &[2], true);
        x.sum().unwrap().backward().unwrap();
        let y = x.to_device(Device::CPU).unwrap();
        assert!(y.borrow().requires_grad);
        assert!(y.grad().is_none());
        assert_eq!(y.to_vec(), vec![1.0, 2.0]);
        assert!(!Rc::ptr_eq(&x, &y));
    }

    #[test]
    fn zero_grad_clears() {
        let x = RawTensor::new(vec![3.0], &[1], true);
        x.sum().unwrap().backward().unwrap();
        assert!(x.grad().is_some());
        x.zero_grad();
        assert!(x.grad().is_none());
    }
}
