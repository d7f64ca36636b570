//! State-dict snapshots of module parameters and their bincode files

use crate::error::{NdconvError, Result};
use crate::tensor::{RawTensor, Tensor};
use bincode::{Decode, Encode, config};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Parameter values keyed by name (`"W"`, `"b"`)
pub type StateDict = BTreeMap<String, TensorData>;

// Serializable representation of tensor data
#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TensorData {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl TensorData {
    /// Snapshot a tensor's values (read from the host mirror on GPU)
    pub fn from_tensor(t: &Tensor) -> Self {
        let borrowed = t.borrow();
        TensorData {
            data: borrowed.data.to_vec(),
            shape: borrowed.shape.clone(),
        }
    }

    /// Rebuild a CPU tensor
    pub fn to_tensor(&self, requires_grad: bool) -> Result<Tensor> {
        RawTensor::from_vec(self.data.clone(), &self.shape, requires_grad)
    }
}

pub fn save_state_dict(state: &StateDict, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::create(path)?;
    let encoded = bincode::encode_to_vec(state, config::standard())
        .map_err(|e| NdconvError::Serialization(e.to_string()))?;
    file.write_all(&encoded)?;
    Ok(())
}

pub fn load_state_dict(path: impl AsRef<Path>) -> Result<StateDict> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let (state, _): (StateDict, _) = bincode::decode_from_slice(&buffer, config::standard())
        .map_err(|e| NdconvError::Serialization(e.to_string()))?;
    Ok(state)
}
