use candle_core::{DType, Device};
use tracing::info;
use tracing::warn;

use crate::error::CoreResult;

/// Selects the best available compute device.
///
/// When the `cuda` feature is enabled and `prefer_gpu` is true, attempts to
/// acquire CUDA device `cuda_device_id`. Falls back to CPU on any error.
pub fn select_device(prefer_gpu: bool, #[allow(unused_variables)] cuda_device_id: usize) -> CoreResult<Device> {
    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(cuda_device_id) {
            Ok(dev) => {
                info!(cuda_device_id, "Using CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(feature = "metal")]
    if prefer_gpu {
        match Device::new_metal(cuda_device_id) {
            Ok(dev) => {
                info!("Using Metal device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "Metal unavailable, falling back to CPU");
            }
        }
    }

    info!("Using CPU device");
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    if prefer_gpu {
        warn!(
            "GPU requested but the binary was not compiled with GPU support. \
             Rebuild with `--features cuda` (requires the NVIDIA CUDA toolkit)."
        );
    }
    Ok(Device::Cpu)
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Weight dtype used for training on `device`.
///
/// | Device | mixed precision | dtype |
/// |--------|-----------------|-------|
/// | CUDA   | on              | BF16  |
/// | CUDA   | off             | F32   |
/// | CPU / Metal | any        | F32   |
///
/// BF16 halves activation and weight memory on CUDA. Losses are always
/// computed in F32 by the caller. CPU kernels for BF16 matmul are too slow to
/// be useful, so CPU stays in F32 regardless of the flag.
pub fn training_dtype(device: &Device, mixed_precision: bool) -> DType {
    match device {
        Device::Cuda(_) if mixed_precision => DType::BF16,
        _ => DType::F32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_device_no_gpu_returns_cpu() {
        let device = select_device(false, 0).unwrap();
        assert!(
            matches!(device, Device::Cpu),
            "prefer_gpu=false must always return CPU"
        );
    }

    #[test]
    fn test_select_device_gpu_falls_back_without_features() {
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            let device = select_device(true, 0).unwrap();
            assert!(matches!(device, Device::Cpu));
        }
    }

    #[test]
    fn test_device_name_cpu() {
        assert_eq!(device_name(&Device::Cpu), "CPU");
    }

    #[test]
    fn test_cpu_training_dtype_is_f32_even_with_mixed_precision() {
        assert_eq!(training_dtype(&Device::Cpu, true), DType::F32);
        assert_eq!(training_dtype(&Device::Cpu, false), DType::F32);
    }
}
