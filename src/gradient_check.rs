//! Numerical verification of analytic gradients
//!
//! The analytic gradient comes from one backward pass seeded with `gy`. The
//! numerical gradient of each array element is a central difference of
//! `sum(func(x) * gy)`.

use crate::error::Result;
use crate::tensor::{Tensor, TensorOps};
use crate::testing::{CheckError, first_mismatch};

/// Step size and tolerances for [`check_backward`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOptions {
    pub eps: f32,
    pub rtol: f32,
    pub atol: f32,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            eps: 1e-3,
            rtol: 1e-4,
            atol: 1e-5,
        }
    }
}

impl CheckOptions {
    pub fn new(eps: f32, rtol: f32, atol: f32) -> Self {
        CheckOptions { eps, rtol, atol }
    }
}

fn set_element(t: &Tensor, index: usize, value: f32) -> Result<()> {
    t.borrow_mut().data.modify(|d| d[index] = value)
}

fn get_element(t: &Tensor, index: usize) -> f32 {
    t.borrow().data.as_slice()[index]
}

/// `sum((f(v + eps) - f(v - eps)) * gy) / (2 * eps)` for one element
///
/// The divisor uses the steps actually stored in f32.
fn central_difference<F>(f: &mut F, target: &Tensor, index: usize, orig: f32, eps: f32, gy: &[f32]) -> Result<f32>
where
    F: FnMut() -> Result<Vec<f32>>,
{
    set_element(target, index, orig + eps)?;
    let hi = get_element(target, index);
    let y_plus = f()?;
    set_element(target, index, orig - eps)?;
    let lo = get_element(target, index);
    let y_minus = f()?;

    let dot: f64 = y_plus
        .iter()
        .zip(&y_minus)
        .zip(gy)
        .map(|((&p, &m), &g)| f64::from(p - m) * f64::from(g))
        .sum();
    Ok((dot / (f64::from(hi) - f64::from(lo))) as f32)
}

/// Numerical gradient of `sum(f() * gy)` with respect to every element of
/// `target`
///
/// `f` must read `target` when called. Each element is restored after it
/// has been perturbed, also when `f` fails.
pub fn numerical_grad<F>(mut f: F, target: &Tensor, gy: &[f32], eps: f32) -> Result<Vec<f32>>
where
    F: FnMut() -> Result<Vec<f32>>,
{
    let len = target.borrow().data.len();
    let mut grad = Vec::with_capacity(len);
    for index in 0..len {
        let orig = get_element(target, index);
        let g = central_difference(&mut f, target, index, orig, eps, gy);
        set_element(target, index, orig)?;
        grad.push(g?);
    }
    Ok(grad)
}

/// Compare the analytic gradients of `func` with central differences
///
/// `x` and every tensor in `params` are checked, in that order; array
/// indices in errors count `x` as 0. `x` is marked as requiring grad.
/// Existing gradients on `x` and `params` are cleared first.
///
/// Works on either backend, provided `x`, `gy` and `params` live where
/// `func` expects them.
pub fn check_backward<F>(
    func: F,
    x: &Tensor,
    gy: &Tensor,
    params: &[Tensor],
    opts: &CheckOptions,
) -> std::result::Result<(), CheckError>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    x.borrow_mut().requires_grad = true;
    x.zero_grad();
    for p in params {
        p.zero_grad();
    }

    let y = func(x)?;
    if y.shape() != gy.shape() {
        return Err(CheckError::Shape {
            expected: y.shape(),
            actual: gy.shape(),
        });
    }
    y.backward_with_grad(gy)?;
    drop(y);

    let targets: Vec<&Tensor> = std::iter::once(x).chain(params).collect();
    let analytic = targets
        .iter()
        .enumerate()
        .map(|(array, t)| t.grad().ok_or(CheckError::MissingGradient { array }))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let gy_host = gy.to_vec();
    for (array, (target, analytic)) in targets.iter().zip(&analytic).enumerate() {
        let numerical = numerical_grad(|| Ok(func(x)?.to_vec()), target, &gy_host, opts.eps)?;
        tracing::debug!(array, len = numerical.len(), "compared gradient");
        if let Some((index, max_err)) = first_mismatch(analytic, &numerical, opts.atol, opts.rtol) {
            return Err(CheckError::GradientMismatch {
                array,
                index,
                analytic: analytic[index],
                numerical: numerical[index],
                max_err,
            });
        }
    }
    Ok(())
}
