//! # ndconv
//!
//! N-dimensional transposed convolution ("deconvolution") with a small
//! reverse-mode autograd, CPU and wgpu backends, and the tooling to verify
//! the layer: forward parity between backends and gradient checks against
//! central differences.
//!
//! ```
//! use ndconv::{DeconvolutionND, Module, RawTensor, TensorOps};
//!
//! let link = DeconvolutionND::new(2, 3, 2, 3usize, 2usize, 1usize, None, None, None).unwrap();
//! let x = RawTensor::uniform(&[2, 3, 4, 3], -1.0, 1.0);
//! let y = link.forward(&x).unwrap();
//! assert_eq!(y.shape(), vec![2, 2, 7, 5]);
//! ```

pub mod autograd;
pub mod conv_utils;
pub mod device;
pub mod dtype;
pub mod error;
pub mod gradient_check;
pub mod initializers;
pub mod io;
pub mod nn;
pub mod ops;
pub mod storage;
pub mod tensor;
pub mod testing;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use conv_utils::{deconv_outsizes, get_conv_outsize, get_deconv_outsize};
pub use device::Device;
pub use dtype::DType;
pub use error::{NdconvError, Result};
pub use gradient_check::{CheckOptions, check_backward, numerical_grad};
pub use initializers::Initializer;
pub use io::{StateDict, TensorData, load_state_dict, save_state_dict};
pub use nn::{DeconvolutionND, IntoNd, Module};
pub use ops::{DeconvAlgo, deconvolution_nd};
pub use storage::Storage;
pub use tensor::{RawTensor, Tensor, TensorOps};
pub use testing::{CheckError, DeconvCase, assert_allclose, gpu_device, product, retry};

#[cfg(feature = "gpu")]
pub use gpu::{gpu_sync, is_gpu_available};
