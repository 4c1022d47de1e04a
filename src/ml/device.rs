// ============================================================
// Layer 5 — Compute Device
// ============================================================
// The backend is picked once, from the CLI, and the device is
// passed down explicitly from there:
//
//   cpu   NdArray<f32>       (tests, small runs)
//   wgpu  Wgpu (Vulkan / Metal / DX12)
//
// Training wraps either in Autodiff; validation and prediction
// run on the plain backend.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub type CpuBackend      = burn::backend::NdArray<f32>;
pub type GpuBackend      = burn::backend::Wgpu;
pub type CpuTrainBackend = burn::backend::Autodiff<CpuBackend>;
pub type GpuTrainBackend = burn::backend::Autodiff<GpuBackend>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Wgpu,
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu"  => Ok(DeviceKind::Cpu),
            "wgpu" | "gpu" => Ok(DeviceKind::Wgpu),
            other  => Err(format!("unknown device '{other}' (expected cpu or wgpu)")),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Cpu  => "cpu",
            DeviceKind::Wgpu => "wgpu",
        })
    }
}

pub fn cpu_device() -> burn::backend::ndarray::NdArrayDevice {
    burn::backend::ndarray::NdArrayDevice::Cpu
}

pub fn wgpu_device() -> burn::backend::wgpu::WgpuDevice {
    burn::backend::wgpu::WgpuDevice::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parsing() {
        assert_eq!("CPU".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("gpu".parse::<DeviceKind>().unwrap(), DeviceKind::Wgpu);
        assert!("tpu".parse::<DeviceKind>().is_err());
        assert_eq!(DeviceKind::Wgpu.to_string(), "wgpu");
    }
}
