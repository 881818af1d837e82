//! Device types and the execution context handle.
//!
//! # Supported Devices
//!
//! - `Cpu`: Pure Rust kernels, parallelized with `rayon` above a size threshold.
//! - `Gpu`: Accepted by matchers and configuration so registrations can be
//!   keyed on it; no GPU kernels ship with this crate.
//!
//! Unlike a process-wide backend switch, the device is a property of each
//! operator configuration and each [`DeviceCtx`]. Kernels receive the
//! context on every compute call and only forward it to the numeric
//! primitives in [`crate::ndarray`].

use core::convert::TryFrom;
use core::fmt;

/// Enumeration of devices a kernel can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum DeviceType {
    /// Host CPU (default).
    #[default]
    Cpu = 0,
    /// Accelerator device.
    Gpu = 1,
}

impl TryFrom<u8> for DeviceType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Gpu),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

/// Element count below which CPU loops stay sequential.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 15;

/// Opaque execution context passed into every compute call.
///
/// Kernels never inspect it beyond handing it to [`crate::ndarray`]
/// primitives, which use it to decide between a sequential loop and a
/// `rayon` parallel one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCtx {
    device_type: DeviceType,
    parallel_threshold: usize,
}

impl DeviceCtx {
    /// Creates a context for `device_type` with the default threshold.
    #[must_use]
    pub const fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    /// Creates a CPU context.
    #[must_use]
    pub const fn cpu() -> Self {
        Self::new(DeviceType::Cpu)
    }

    /// Overrides the element count at which loops go parallel.
    ///
    /// A threshold of `0` parallelizes everything, `usize::MAX` nothing.
    #[must_use]
    pub const fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// The device this context drives.
    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Whether a loop over `len` elements should run on the `rayon` pool.
    #[must_use]
    pub const fn should_parallelize(&self, len: usize) -> bool {
        len >= self.parallel_threshold
    }
}

impl Default for DeviceCtx {
    fn default() -> Self {
        Self::cpu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_round_trips_through_u8() {
        for device in [DeviceType::Cpu, DeviceType::Gpu] {
            assert_eq!(DeviceType::try_from(device as u8), Ok(device));
        }
        assert!(DeviceType::try_from(7).is_err());
    }

    #[test]
    fn threshold_controls_parallelism() {
        let ctx = DeviceCtx::cpu().with_parallel_threshold(4);
        assert!(!ctx.should_parallelize(3));
        assert!(ctx.should_parallelize(4));
        assert!(!DeviceCtx::cpu()
            .with_parallel_threshold(usize::MAX)
            .should_parallelize(1 << 20));
    }
}
