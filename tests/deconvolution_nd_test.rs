//! Verification of `DeconvolutionND` over the full configuration grid
//!
//! Every configuration gets three tests: CPU/GPU forward consistency, a
//! gradient check on the CPU and the same gradient check on the GPU. GPU
//! tests return early when no adapter is available. Each check is retried
//! up to three times with fresh random tensors.

use ndconv::testing::{DeconvFixture, allclose_default};
use ndconv::{
    CheckError, CheckOptions, DType, DeconvCase, DeconvolutionND, Device, Module, NdconvError,
    Tensor, TensorOps, check_backward, gpu_device, load_state_dict, product, retry,
    save_state_dict,
};
use tracing_subscriber::EnvFilter;

const ATTEMPTS: usize = 3;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_case(dims: &[usize], nobias: bool, fast_path: bool, use_outsize: bool) -> DeconvCase {
    DeconvCase {
        dims: dims.to_vec(),
        nobias,
        dtype: DType::F32,
        fast_path,
        use_outsize,
    }
}

fn backward_options() -> CheckOptions {
    CheckOptions::new(1e-2, 1e-4, 1e-4)
}

fn ensure_dtype(expected: DType, y: &Tensor) -> Result<(), CheckError> {
    let actual = y.dtype();
    if actual != expected {
        return Err(CheckError::DTypeChanged { expected, actual });
    }
    Ok(())
}

/// The tensor is labelled `device` and its data really is in GPU storage
fn ensure_on_gpu(name: &str, t: &Tensor, device: &Device) -> Result<(), CheckError> {
    let t = t.borrow();
    if t.device != *device || !t.data.is_gpu() {
        return Err(NdconvError::DeviceError(format!(
            "{name} is on {} with {:?}, expected GPU storage on {device}",
            t.device, t.data
        ))
        .into());
    }
    Ok(())
}

/// Forward on CPU, move link and input to `device`, forward again and compare
fn check_forward_consistency(f: &mut DeconvFixture, device: &Device) -> Result<(), CheckError> {
    let x_dtype = f.x.dtype();
    let y_cpu = f.link.forward(&f.x)?;
    ensure_dtype(x_dtype, &y_cpu)?;

    f.link.to_device(device.clone())?;
    for (i, p) in f.link.parameters().iter().enumerate() {
        ensure_on_gpu(&format!("parameter {i}"), p, device)?;
    }
    let x_gpu = f.x.to_device(device.clone())?;
    let y_gpu = f.link.forward(&x_gpu)?;
    ensure_dtype(x_dtype, &y_gpu)?;
    ensure_on_gpu("output", &y_gpu, device)?;

    allclose_default(&y_cpu.to_vec(), &y_gpu.to_vec())
}

fn check_link_backward(link: &DeconvolutionND, x: &Tensor, gy: &Tensor) -> Result<(), CheckError> {
    let mut params = vec![link.w().clone()];
    if let Some(b) = link.b() {
        params.push(b.clone());
    }
    check_backward(|x| link.forward(x), x, gy, &params, &backward_options())
}

fn run_forward_consistency(case: &DeconvCase) {
    init_tracing();
    let Some(device) = gpu_device() else {
        return;
    };
    retry(ATTEMPTS, || {
        let mut f = case.fixture()?;
        check_forward_consistency(&mut f, &device)
    })
    .unwrap_or_else(|e| panic!("forward consistency [{case}]: {e}"));
}

fn run_backward_cpu(case: &DeconvCase) {
    init_tracing();
    retry(ATTEMPTS, || {
        let mut f = case.fixture()?;
        f.link.zero_grad();
        check_link_backward(&f.link, &f.x, &f.gy)
    })
    .unwrap_or_else(|e| panic!("backward cpu [{case}]: {e}"));
}

fn run_backward_gpu(case: &DeconvCase) {
    init_tracing();
    let Some(device) = gpu_device() else {
        return;
    };
    retry(ATTEMPTS, || {
        let mut f = case.fixture()?;
        f.link.zero_grad();
        f.link.to_device(device.clone())?;
        let x = f.x.to_device(device.clone())?;
        let gy = f.gy.to_device(device.clone())?;
        check_link_backward(&f.link, &x, &gy)
    })
    .unwrap_or_else(|e| panic!("backward gpu [{case}]: {e}"));
}

macro_rules! deconv_cases {
    ($($name:ident: dims = $dims:expr, nobias = $nobias:expr, fast_path = $fast:expr, use_outsize = $outsize:expr;)*) => {
        $(
            mod $name {
                use super::*;

                fn case() -> DeconvCase {
                    make_case(&$dims, $nobias, $fast, $outsize)
                }

                #[test]
                fn forward_consistency() {
                    run_forward_consistency(&case());
                }

                #[test]
                fn backward_cpu() {
                    run_backward_cpu(&case());
                }

                #[test]
                fn backward_gpu() {
                    run_backward_gpu(&case());
                }
            }
        )*

        #[test]
        fn listed_cases_cover_the_product() {
            let listed = vec![$(make_case(&$dims, $nobias, $fast, $outsize)),*];
            let expected = product(
                &[&[5, 4, 3], &[4, 3], &[3]],
                &[true, false],
                &[true, false],
                &[true, false],
            );
            assert_eq!(listed.len(), expected.len());
            for case in &expected {
                assert!(listed.contains(case), "missing {case}");
            }
        }
    };
}

deconv_cases! {
    d543_nobias_fast_outsize: dims = [5, 4, 3], nobias = true, fast_path = true, use_outsize = true;
    d543_nobias_fast: dims = [5, 4, 3], nobias = true, fast_path = true, use_outsize = false;
    d543_nobias_gemm_outsize: dims = [5, 4, 3], nobias = true, fast_path = false, use_outsize = true;
    d543_nobias_gemm: dims = [5, 4, 3], nobias = true, fast_path = false, use_outsize = false;
    d543_bias_fast_outsize: dims = [5, 4, 3], nobias = false, fast_path = true, use_outsize = true;
    d543_bias_fast: dims = [5, 4, 3], nobias = false, fast_path = true, use_outsize = false;
    d543_bias_gemm_outsize: dims = [5, 4, 3], nobias = false, fast_path = false, use_outsize = true;
    d543_bias_gemm: dims = [5, 4, 3], nobias = false, fast_path = false, use_outsize = false;
    d43_nobias_fast_outsize: dims = [4, 3], nobias = true, fast_path = true, use_outsize = true;
    d43_nobias_fast: dims = [4, 3], nobias = true, fast_path = true, use_outsize = false;
    d43_nobias_gemm_outsize: dims = [4, 3], nobias = true, fast_path = false, use_outsize = true;
    d43_nobias_gemm: dims = [4, 3], nobias = true, fast_path = false, use_outsize = false;
    d43_bias_fast_outsize: dims = [4, 3], nobias = false, fast_path = true, use_outsize = true;
    d43_bias_fast: dims = [4, 3], nobias = false, fast_path = true, use_outsize = false;
    d43_bias_gemm_outsize: dims = [4, 3], nobias = false, fast_path = false, use_outsize = true;
    d43_bias_gemm: dims = [4, 3], nobias = false, fast_path = false, use_outsize = false;
    d3_nobias_fast_outsize: dims = [3], nobias = true, fast_path = true, use_outsize = true;
    d3_nobias_fast: dims = [3], nobias = true, fast_path = true, use_outsize = false;
    d3_nobias_gemm_outsize: dims = [3], nobias = true, fast_path = false, use_outsize = true;
    d3_nobias_gemm: dims = [3], nobias = true, fast_path = false, use_outsize = false;
    d3_bias_fast_outsize: dims = [3], nobias = false, fast_path = true, use_outsize = true;
    d3_bias_fast: dims = [3], nobias = false, fast_path = true, use_outsize = false;
    d3_bias_gemm_outsize: dims = [3], nobias = false, fast_path = false, use_outsize = true;
    d3_bias_gemm: dims = [3], nobias = false, fast_path = false, use_outsize = false;
}

#[test]
fn forward_keeps_input_dtype_for_every_case() {
    init_tracing();
    let cases = product(&[&[5, 4, 3], &[4, 3], &[3]], &[true, false], &[true, false], &[true, false]);
    for case in cases {
        let f = case.fixture().unwrap();
        let y = f.link.forward(&f.x).unwrap();
        assert_eq!(y.dtype(), f.x.dtype(), "{case}");
        assert_eq!(y.shape(), f.gy.shape(), "{case}");
    }
}

#[test]
fn no_initial_bias() {
    let link = DeconvolutionND::new(3, 3, 2, 3usize, 1usize, 0usize, None, None, None).unwrap();
    assert!(link.b().is_none());
}

#[test]
fn one_dimensional_with_outsize_uses_gy_of_five() {
    let case = make_case(&[3], false, false, true);
    let f = case.fixture().unwrap();
    assert_eq!(f.x.shape(), vec![2, 3, 3]);
    assert_eq!(f.gy.shape(), vec![2, 2, 5]);
    assert_eq!(f.link.forward(&f.x).unwrap().shape(), vec![2, 2, 5]);
}

#[test]
fn two_dimensional_without_bias_checks_only_w() {
    let case = make_case(&[4, 3], true, true, false);
    let f = case.fixture().unwrap();
    assert_eq!(case.outs().unwrap(), vec![7, 5]);
    assert_eq!(f.link.parameters().len(), 1);
    assert_eq!(f.link.forward(&f.x).unwrap().shape(), vec![2, 2, 7, 5]);
}

#[test]
fn gradient_check_rejects_mismatched_gy() {
    let case = make_case(&[4, 3], false, true, false);
    let f = case.fixture().unwrap();
    let wrong_gy = ndconv::RawTensor::uniform(&[2, 2, 7, 4], -1.0, 1.0);
    let err = check_link_backward(&f.link, &f.x, &wrong_gy).unwrap_err();
    assert!(matches!(err, CheckError::Shape { .. }));
}

#[test]
fn forward_consistency_fails_without_a_reachable_gpu() {
    init_tracing();
    if gpu_device().is_some() {
        return;
    }
    let mut f = make_case(&[4, 3], false, true, false).fixture().unwrap();
    let err = check_forward_consistency(&mut f, &Device::GPU("not-a-gpu".to_string())).unwrap_err();
    assert!(matches!(err, CheckError::Op(NdconvError::DeviceError(_))), "{err}");
    // nothing moved, so the link still runs on the CPU
    assert!(!f.link.w().borrow().data.is_gpu());
    assert_eq!(f.link.w().device(), Device::CPU);
    assert!(f.link.forward(&f.x).is_ok());
}

#[test]
fn forward_consistency_runs_on_gpu_storage() {
    init_tracing();
    let Some(device) = gpu_device() else {
        return;
    };
    let mut f = make_case(&[3], false, true, true).fixture().unwrap();
    check_forward_consistency(&mut f, &device).unwrap();
    assert!(f.link.w().borrow().data.is_gpu());
    assert!(f.link.b().unwrap().borrow().data.is_gpu());
}

/// A saved link reproduces the same forward output when loaded elsewhere,
/// including into a link whose parameters live on the GPU
#[test]
fn saved_parameters_reproduce_forward_output() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let case = make_case(&[4, 3], false, true, true);
    let f = case.fixture().unwrap();
    let path = dir.path().join("link.bin");
    save_state_dict(&f.link.state_dict(), &path).unwrap();
    let y_ref = f.link.forward(&f.x).unwrap().to_vec();

    let state = load_state_dict(&path).unwrap();
    let mut cpu_link = case.fixture().unwrap().link;
    cpu_link.load_state_dict(&state).unwrap();
    assert_eq!(cpu_link.forward(&f.x).unwrap().to_vec(), y_ref);

    let Some(device) = gpu_device() else {
        return;
    };
    let mut gpu_link = case.fixture().unwrap().link;
    gpu_link.to_device(device.clone()).unwrap();
    gpu_link.load_state_dict(&state).unwrap();
    assert!(gpu_link.w().borrow().data.is_gpu());
    let y_gpu = gpu_link.forward(&f.x.to_device(device).unwrap()).unwrap();
    allclose_default(&y_gpu.to_vec(), &y_ref).unwrap();
}
