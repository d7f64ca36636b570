use crate::device::Device;
use crate::error::Result;
use crate::io::StateDict;
use crate::tensor::Tensor;

pub mod deconvolution_nd;

pub use deconvolution_nd::{DeconvolutionND, IntoNd};

pub trait Module {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;
    fn parameters(&self) -> Vec<Tensor>;

    // State dict methods
    fn state_dict(&self) -> StateDict;
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    fn zero_grad(&mut self) {
        for p in self.parameters() {
            p.borrow_mut().grad = None;
        }
    }

    /// Move all module parameters to a specific device
    ///
    /// Parameters are updated in place, so handles obtained from
    /// [`Module::parameters`] before the move stay valid and see the new
    /// storage. Accumulated gradients move along with the values. A failed
    /// transfer is returned as an error; parameters moved before it stay
    /// moved, the failing one keeps its old storage and device.
    ///
    /// # Example
    /// ```no_run
    /// # use ndconv::{DeconvolutionND, Device, Module};
    /// let mut layer = DeconvolutionND::new(2, 3, 2, 3usize, 2usize, 1usize, None, None, None).unwrap();
    /// if let Some(device) = Device::gpu() {
    ///     layer.to_device(device).unwrap();
    /// }
    /// ```
    fn to_device(&mut self, device: Device) -> Result<()> {
        for param in self.parameters() {
            let mut p = param.borrow_mut();
            if p.device == device && p.data.is_gpu() == device.is_gpu() {
                continue;
            }
            tracing::debug!(from = %p.device, to = %device, shape = ?p.shape, "moving parameter");
            let data = p.data.to_device(&device)?;
            let grad = p.grad.as_ref().map(|g| g.to_device(&device)).transpose()?;
            p.data = data;
            p.grad = grad;
            p.device = device.clone();
        }
        Ok(())
    }
}
