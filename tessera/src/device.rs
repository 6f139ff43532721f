//! Device and precision selection

use std::fmt;

use crate::dtype::DType;

/// Where a rank's weights live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Host memory
    Cpu,
    /// CUDA device by ordinal
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// Device plus the dtype weights are materialized in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpec {
    pub device: Device,
    pub dtype: DType,
}

impl DeviceSpec {
    /// Host device with f32 weights.
    pub const HOST_F32: Self = Self {
        device: Device::Cpu,
        dtype: DType::F32,
    };
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device, self.dtype)
    }
}

/// Accelerators visible to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardware {
    accelerators: usize,
}

impl Hardware {
    /// Probe the machine.
    ///
    /// With the `cuda` feature this asks the CUDA driver for its device
    /// count; a missing or failing driver counts as no accelerator. Without
    /// the feature, no accelerator is reported.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            accelerators: cuda_device_count(),
        }
    }

    /// A machine without accelerators.
    #[must_use]
    pub fn host_only() -> Self {
        Self { accelerators: 0 }
    }

    #[must_use]
    pub fn with_accelerators(accelerators: usize) -> Self {
        Self { accelerators }
    }

    #[must_use]
    pub fn accelerator_present(&self) -> bool {
        self.accelerators > 0
    }

    #[must_use]
    pub fn accelerators(&self) -> usize {
        self.accelerators
    }
}

#[cfg(feature = "cuda")]
fn cuda_device_count() -> usize {
    match cudarc::driver::CudaDevice::count() {
        Ok(n) => usize::try_from(n).unwrap_or(0),
        Err(e) => {
            tracing::debug!(error = ?e, "CUDA driver unavailable");
            0
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn cuda_device_count() -> usize {
    0
}

/// Pick the device and default precision for `rank`.
///
/// An accelerator means `cuda:rank` in f16, otherwise the host in f32. An
/// explicit dtype always wins.
#[must_use]
pub fn select(hardware: &Hardware, rank: usize, explicit_dtype: Option<DType>) -> DeviceSpec {
    let (device, default_dtype) = if hardware.accelerator_present() {
        (Device::Cuda(rank), DType::F16)
    } else {
        (Device::Cpu, DType::F32)
    };
    DeviceSpec {
        device,
        dtype: explicit_dtype.unwrap_or(default_dtype),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_policy_table() {
        let gpu = Hardware::with_accelerators(4);
        let host = Hardware::host_only();

        assert_eq!(
            select(&gpu, 2, None),
            DeviceSpec {
                device: Device::Cuda(2),
                dtype: DType::F16
            }
        );
        assert_eq!(
            select(&gpu, 1, Some(DType::BF16)),
            DeviceSpec {
                device: Device::Cuda(1),
                dtype: DType::BF16
            }
        );
        assert_eq!(select(&host, 3, None), DeviceSpec::HOST_F32);
        assert_eq!(
            select(&host, 0, Some(DType::F16)),
            DeviceSpec {
                device: Device::Cpu,
                dtype: DType::F16
            }
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Device::Cuda(3).to_string(), "cuda:3");
        assert_eq!(DeviceSpec::HOST_F32.to_string(), "cpu (f32)");
    }
}
