//! Element type tags for tensors
//!
//! Tensor data is stored as `f32` on both backends, so `F32` is the only
//! variant today. The enum is non-exhaustive so wider or narrower floats can
//! be added without breaking matches downstream.

use std::fmt;

/// Supported tensor data types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
#[repr(u8)]
pub enum DType {
    /// 32-bit floating point
    #[default]
    F32 = 2,
}

impl DType {
    /// Returns the size in bytes of a single element of this dtype
    #[must_use]
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
        }
    }

    /// Returns the name of this dtype as a string
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
        }
    }

    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
