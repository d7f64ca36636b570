//! Output-size arithmetic shared by convolution and transposed convolution
//!
//! Both functions work per spatial axis. They return an error rather than
//! wrapping when the geometry would produce a non-positive size.

use crate::error::{NdconvError, Result};

/// Output length of a convolution along one axis
///
/// `(size + 2*pad - k) / s + 1`, or with `cover_all` the last partial window
/// is kept: `(size + 2*pad - k + s - 1) / s + 1`.
pub fn get_conv_outsize(size: usize, k: usize, s: usize, p: usize, cover_all: bool) -> Result<usize> {
    if s == 0 {
        return Err(NdconvError::InvalidParameter("stride must be positive".to_string()));
    }
    let padded = size + 2 * p;
    let span = if cover_all { padded + s - 1 } else { padded };
    let rem = span.checked_sub(k).ok_or_else(|| {
        NdconvError::InvalidParameter(format!(
            "kernel {k} larger than padded input {padded} (size={size}, pad={p})"
        ))
    })?;
    Ok(rem / s + 1)
}

/// Output length of a transposed convolution along one axis
///
/// `s*(size-1) + k - 2*pad`, or with `cover_all` `s*(size-1) + k - s + 1 - 2*pad`.
/// This is the inverse of [`get_conv_outsize`]: for the default mode,
/// `get_conv_outsize(get_deconv_outsize(n, ..), ..) == n`.
pub fn get_deconv_outsize(size: usize, k: usize, s: usize, p: usize, cover_all: bool) -> Result<usize> {
    if s == 0 {
        return Err(NdconvError::InvalidParameter("stride must be positive".to_string()));
    }
    if size == 0 {
        return Err(NdconvError::InvalidParameter("input size must be positive".to_string()));
    }
    let grown = s * (size - 1) + k;
    let grown = if cover_all {
        (grown + 1).checked_sub(s)
    } else {
        Some(grown)
    };
    match grown.and_then(|g| g.checked_sub(2 * p)) {
        Some(out) if out > 0 => Ok(out),
        _ => Err(NdconvError::InvalidParameter(format!(
            "padding {p} leaves no output for size={size}, k={k}, s={s}"
        ))),
    }
}

/// Per-axis [`get_deconv_outsize`] over matching slices
pub fn deconv_outsizes(
    dims: &[usize],
    ksize: &[usize],
    stride: &[usize],
    pad: &[usize],
) -> Result<Vec<usize>> {
    if ksize.len() != dims.len() || stride.len() != dims.len() || pad.len() != dims.len() {
        return Err(NdconvError::InvalidParameter(format!(
            "rank mismatch: dims={dims:?} ksize={ksize:?} stride={stride:?} pad={pad:?}"
        )));
    }
    dims.iter()
        .zip(ksize)
        .zip(stride)
        .zip(pad)
        .map(|(((&d, &k), &s), &p)| get_deconv_outsize(d, k, s, p, false))
        .collect()
}
