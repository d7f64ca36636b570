#![cfg(feature = "gpu")]
//! CPU/GPU parity of the raw deconvolution kernels

use ndconv::gpu::{self, DeconvGeometryParams, GpuBuffer, GpuKernels};
use ndconv::{DeconvAlgo, Device, RawTensor, TensorOps, assert_allclose, deconvolution_nd};

fn ramp(len: usize, phase: f32) -> Vec<f32> {
    (0..len).map(|i| ((i as f32) * 0.37 + phase).sin()).collect()
}

#[test]
fn test_gpu_available() {
    // Only checks that initialization doesn't panic
    let available = gpu::is_gpu_available();
    println!("GPU available: {available}");
}

#[test]
fn test_matmul_batched_with_transposed_a() {
    if !gpu::is_gpu_available() {
        return;
    }
    // A stored (k=2, m=2) = [[1, 2], [3, 4]], so op(A) = [[1, 3], [2, 4]]
    let a = GpuBuffer::from_slice(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    // two batches of (2, 1)
    let b = GpuBuffer::from_slice(&[1.0, 1.0, 0.0, 1.0]).unwrap();
    let c = GpuKernels::matmul_batched(&a, &b, 2, 2, 1, 2, true).unwrap();
    assert_eq!(c.to_vec(), vec![4.0, 6.0, 3.0, 4.0]);
}

#[test]
fn test_forward_kernel_one_dimensional() {
    if !gpu::is_gpu_available() {
        return;
    }
    let geom = DeconvGeometryParams::new(1, 1, 1, true, &[3], &[5], &[3], &[2], &[1]).unwrap();
    let x = GpuBuffer::from_slice(&[1.0, 2.0, 3.0]).unwrap();
    let w = GpuBuffer::from_slice(&[1.0, 10.0, 100.0]).unwrap();
    let b = GpuBuffer::from_slice(&[0.5]).unwrap();
    let y = GpuKernels::deconv_forward(&geom, &x, &w, &b).unwrap();
    assert_eq!(y.to_vec(), vec![10.5, 102.5, 20.5, 203.5, 30.5]);
}

fn parity(x_shape: &[usize], w_shape: &[usize], stride: &[usize], pad: &[usize], algo: DeconvAlgo) {
    let Some(device) = Device::gpu() else {
        return;
    };
    let x_len = x_shape.iter().product();
    let w_len = w_shape.iter().product();
    let c_out = w_shape[1];

    let x = RawTensor::new(ramp(x_len, 0.0), x_shape, true);
    let w = RawTensor::new(ramp(w_len, 1.3), w_shape, true);
    let b = RawTensor::new(ramp(c_out, 2.1), &[c_out], true);
    let y = deconvolution_nd(&x, &w, Some(&b), stride, pad, None, algo).unwrap();
    let gy = RawTensor::new(ramp(y.to_vec().len(), 0.5), &y.shape(), false);
    y.backward_with_grad(&gy).unwrap();

    let xg = x.to_device(device.clone()).unwrap();
    let wg = w.to_device(device.clone()).unwrap();
    let bg = b.to_device(device.clone()).unwrap();
    let yg = deconvolution_nd(&xg, &wg, Some(&bg), stride, pad, None, algo).unwrap();
    assert!(yg.borrow().data.is_gpu());
    yg.backward_with_grad(&gy.to_device(device).unwrap()).unwrap();

    assert_allclose(&yg.to_vec(), &y.to_vec(), 1e-5, 1e-4).unwrap();
    assert_allclose(&xg.grad().unwrap(), &x.grad().unwrap(), 1e-5, 1e-4).unwrap();
    assert_allclose(&wg.grad().unwrap(), &w.grad().unwrap(), 1e-5, 1e-4).unwrap();
    assert_allclose(&bg.grad().unwrap(), &b.grad().unwrap(), 1e-5, 1e-4).unwrap();
}

#[test]
fn test_parity_1d_direct() {
    parity(&[2, 3, 3], &[3, 2, 3], &[2], &[1], DeconvAlgo::Direct);
}

#[test]
fn test_parity_2d_gemm() {
    parity(&[2, 3, 4, 3], &[3, 2, 3, 3], &[2, 2], &[1, 1], DeconvAlgo::Gemm);
}

#[test]
fn test_parity_3d_both() {
    for algo in [DeconvAlgo::Direct, DeconvAlgo::Gemm] {
        parity(&[2, 3, 5, 4, 3], &[3, 2, 3, 3, 3], &[2, 2, 2], &[1, 1, 1], algo);
    }
}

#[test]
fn test_rank_four_on_gpu_is_a_device_error() {
    let Some(device) = Device::gpu() else {
        return;
    };
    let x = RawTensor::zeros(&[1, 1, 2, 2, 2, 2]).to_device(device.clone()).unwrap();
    let w = RawTensor::zeros(&[1, 1, 1, 1, 1, 1]).to_device(device).unwrap();
    let err = deconvolution_nd(&x, &w, None, &[1; 4], &[0; 4], None, DeconvAlgo::Direct).unwrap_err();
    assert!(matches!(err, ndconv::NdconvError::DeviceError(_)));
}
