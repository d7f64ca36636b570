// Deconvolution and its GPU implementation
pub mod deconv;
#[cfg(feature = "gpu")]
mod gpu_ops;

pub use deconv::{DeconvAlgo, DeconvGeometry, DeconvGradFn, deconvolution_nd};
