use crate::errors::InferenceError;
use std::{fmt, str::FromStr};

/// Where a detector runs its model. Fixed for the detector's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Gpu(u32),
    /// Dedicated inference accelerator. One detector drives every camera
    /// assigned to it.
    Accelerator(u32),
}

impl Device {
    pub fn is_shared(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl FromStr for Device {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let invalid = || InferenceError::InvalidDevice(s.to_string());

        if normalized == "cpu" {
            return Ok(Device::Cpu);
        }

        let (kind, index) = normalized.split_once(':').ok_or_else(invalid)?;
        let index: u32 = index.parse().map_err(|_| invalid())?;
        match kind {
            "gpu" | "cuda" => Ok(Device::Gpu(index)),
            "tpu" => Ok(Device::Accelerator(index)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(i) => write!(f, "gpu:{i}"),
            Device::Accelerator(i) => write!(f, "tpu:{i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        assert_eq!("cpu".parse(), Ok(Device::Cpu));
        assert_eq!("gpu:0".parse(), Ok(Device::Gpu(0)));
        assert_eq!("cuda:1".parse(), Ok(Device::Gpu(1)));
        assert_eq!(" TPU:2 ".parse(), Ok(Device::Accelerator(2)));
    }

    #[test]
    fn test_reject_invalid_devices() {
        for bad in ["", "gpu", "gpu:", "gpu:x", "npu:0", "cpu:0", "tpu:-1"] {
            assert!(
                bad.parse::<Device>().is_err(),
                "'{}' should not parse as a device",
                bad
            );
        }
    }

    #[test]
    fn test_display_round_trips() {
        for device in [Device::Cpu, Device::Gpu(3), Device::Accelerator(0)] {
            assert_eq!(device.to_string().parse(), Ok(device));
        }
    }

    #[test]
    fn test_only_accelerators_are_shared() {
        assert!(Device::Accelerator(0).is_shared());
        assert!(!Device::Gpu(0).is_shared());
        assert!(!Device::Cpu.is_shared());
    }
}
