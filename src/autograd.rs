use crate::device::Device;
use crate::error::{NdconvError, Result};
use crate::storage::Storage;
use crate::tensor::{RawTensor, Tensor};
use std::collections::HashSet;

// ===== GRADIENT FUNCTION TRAIT =====

/// Trait for gradient computation functions.
///
/// Each operation type implements this to define how gradients flow backward.
/// The `backward` method takes:
/// - `out_grad`: gradient of loss w.r.t. this operation's output
/// - `parents`: the input tensors to this operation
///
/// Returns one entry per parent (Some if that parent receives a gradient).
pub trait GradFn {
    /// Compute gradients for parent tensors given output gradient
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Result<Vec<Option<Tensor>>>;
    /// Clone this gradient function (needed for Rc/RefCell)
    fn clone_box(&self) -> Box<dyn GradFn>;
}

// ===== BACKPROPAGATION =====

impl RawTensor {
    /// Run backpropagation starting from this tensor
    ///
    /// If the tensor has no gradient yet it is seeded with ones, which is the
    /// usual scalar-loss case. Callers that need a specific upstream gradient
    /// use [`RawTensor::backward_with_grad`].
    ///
    /// Nodes are processed in reverse topological order so each one has
    /// received every consumer's contribution before it propagates further.
    pub fn backward(tensor_ref: &Tensor) -> Result<()> {
        enum Action {
            Visit(Tensor),
            PostVisit(Tensor),
        }

        {
            let mut tensor = tensor_ref.borrow_mut();
            if !tensor.requires_grad {
                return Err(NdconvError::InvalidParameter(
                    "backward called on a tensor that doesn't require grad".to_string(),
                ));
            }
            if tensor.grad.is_none() {
                let base = Storage::cpu(vec![1.0; tensor.data.len()]);
                tensor.grad = Some(base.to_device(&tensor.device)?);
            }
        }

        let mut topo_order = Vec::new();
        let mut visited = HashSet::new();

        // Iterative post-order DFS; deep graphs must not hit the recursion limit
        let mut recursion_stack = vec![Action::Visit(tensor_ref.clone())];

        while let Some(action) = recursion_stack.pop() {
            match action {
                Action::Visit(t) => {
                    if !visited.insert(t.as_ptr()) {
                        continue;
                    }
                    recursion_stack.push(Action::PostVisit(t.clone()));
                    let parents = t.borrow().parents.clone();
                    for parent in parents {
                        recursion_stack.push(Action::Visit(parent));
                    }
                }
                Action::PostVisit(t) => {
                    topo_order.push(t);
                }
            }
        }

        // topo_order is [leaf, ..., root]; consumers must run first
        for tensor in topo_order.into_iter().rev() {
            let (grad_fn, parents, grad_data, shape, device) = {
                let t = tensor.borrow();
                (
                    t.grad_fn.as_ref().map(|gf| gf.clone_box()),
                    t.parents.clone(),
                    t.grad.clone(),
                    t.shape.clone(),
                    t.device.clone(),
                )
            };
            let (Some(grad_fn), Some(grad_out_data)) = (grad_fn, grad_data) else {
                continue;
            };

            let grad_out = RawTensor {
                data: grad_out_data,
                shape,
                grad: None,
                requires_grad: false,
                grad_fn: None,
                parents: vec![],
                device,
            };

            let parent_grads = grad_fn.backward(&grad_out, &parents)?;

            for (parent_grad, parent_ref) in parent_grads.into_iter().zip(parents.iter()) {
                let Some(g) = parent_grad else { continue };
                let mut parent = parent_ref.borrow_mut();
                if !parent.requires_grad {
                    continue;
                }
                let parent_device = parent.device.clone();
                let contribution = g.borrow().data.to_device(&parent_device)?;

                match parent.grad.take() {
                    None => parent.grad = Some(contribution),
                    Some(existing) => {
                        parent.grad = Some(RawTensor::accumulate_grad(
                            &existing,
                            &contribution,
                            &parent_device,
                        )?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Backpropagate with an explicit upstream gradient for this tensor
    ///
    /// Any gradient already stored on `tensor_ref` is replaced by `grad`.
    pub fn backward_with_grad(tensor_ref: &Tensor, grad: &Tensor) -> Result<()> {
        {
            let g = grad.borrow();
            let mut t = tensor_ref.borrow_mut();
            if g.shape != t.shape {
                return Err(NdconvError::ShapeMismatch {
                    op: "backward_with_grad",
                    expected: t.shape.clone(),
                    actual: g.shape.clone(),
                });
            }
            let device = t.device.clone();
            t.grad = Some(g.data.to_device(&device)?);
        }
        Self::backward(tensor_ref)
    }

    /// Add a gradient contribution to an existing gradient
    fn accumulate_grad(existing: &Storage, new_grad: &Storage, device: &Device) -> Result<Storage> {
        if existing.len() != new_grad.len() {
            return Err(NdconvError::ShapeMismatch {
                op: "accumulate_grad",
                expected: vec![existing.len()],
                actual: vec![new_grad.len()],
            });
        }
        let accum: Vec<f32> = existing
            .as_slice()
            .iter()
            .zip(new_grad.as_slice())
            .map(|(a, b)| a + b)
            .collect();
        Storage::cpu(accum).to_device(device)
    }
}
