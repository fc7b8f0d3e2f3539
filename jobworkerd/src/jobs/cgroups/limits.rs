/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use validation::{ValidatedField, ValidationError};

/// CPU bandwidth as a percentage of one core (100 = one full core, 10000 =
/// one hundred cores). Zero means "leave the kernel default".
#[derive(
    Debug, Clone, Copy, Default, Ord, PartialOrd, Eq, PartialEq, Hash,
)]
pub struct CpuPercent(i32);

impl CpuPercent {
    pub fn into_inner(self) -> i32 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl ValidatedField<i32> for CpuPercent {
    fn validate(
        input: Option<i32>,
        field_name: &str,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let input = validation::required(input, field_name, parent_name)?;

        validation::minimum_value(input, 0, "percent", field_name, parent_name)?;
        validation::maximum_value(
            input,
            10_000,
            "percent",
            field_name,
            parent_name,
        )?;

        Ok(Self(input))
    }
}

impl Display for CpuPercent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Memory ceiling in mebibytes. Zero means "leave the kernel default". The
/// upper bound is 1 TiB expressed in MiB.
#[derive(
    Debug, Clone, Copy, Default, Ord, PartialOrd, Eq, PartialEq, Hash,
)]
pub struct MemoryMb(i32);

impl MemoryMb {
    pub fn into_inner(self) -> i32 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }

    pub fn bytes(&self) -> i64 {
        i64::from(self.0) * 1024 * 1024
    }
}

impl ValidatedField<i32> for MemoryMb {
    fn validate(
        input: Option<i32>,
        field_name: &str,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let input = validation::required(input, field_name, parent_name)?;

        validation::minimum_value(input, 0, "MiB", field_name, parent_name)?;
        validation::maximum_value(
            input,
            1_048_576,
            "MiB",
            field_name,
            parent_name,
        )?;

        Ok(Self(input))
    }
}

impl Display for MemoryMb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// IO throughput ceiling in bytes per second. Zero means unlimited.
#[derive(
    Debug, Clone, Copy, Default, Ord, PartialOrd, Eq, PartialEq, Hash,
)]
pub struct IoBps(i32);

impl IoBps {
    pub fn into_inner(self) -> i32 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl ValidatedField<i32> for IoBps {
    fn validate(
        input: Option<i32>,
        field_name: &str,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let input = validation::required(input, field_name, parent_name)?;

        validation::minimum_value(
            input,
            0,
            "bytes/sec",
            field_name,
            parent_name,
        )?;

        Ok(Self(input))
    }
}

impl Display for IoBps {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A block device in cgroup v2 `major:minor` notation. IO limits are written
/// only when the operator has named a real device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoDevice {
    major: u32,
    minor: u32,
}

impl IoDevice {
    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }
}

impl FromStr for IoDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| format!("'{s}' is not in major:minor form"))?;

        let major = major
            .parse::<u32>()
            .map_err(|e| format!("invalid device major '{major}': {e}"))?;
        let minor = minor
            .parse::<u32>()
            .map_err(|e| format!("invalid device minor '{minor}': {e}"))?;

        Ok(Self { major, minor })
    }
}

impl Display for IoDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_bounds() {
        assert!(CpuPercent::validate(Some(0), "cpu", None).is_ok());
        assert!(CpuPercent::validate(Some(10_000), "cpu", None).is_ok());
        assert!(CpuPercent::validate(Some(-1), "cpu", None).is_err());
        assert!(CpuPercent::validate(Some(10_001), "cpu", None).is_err());
    }

    #[test]
    fn test_memory_mb_bounds() {
        assert!(MemoryMb::validate(Some(1), "memory", None).is_ok());
        assert!(MemoryMb::validate(Some(1_048_576), "memory", None).is_ok());
        assert!(MemoryMb::validate(Some(-1), "memory", None).is_err());
        assert!(MemoryMb::validate(Some(1_048_577), "memory", None).is_err());
    }

    #[test]
    fn test_memory_mb_byte_conversion() {
        let limit = MemoryMb::validate(Some(64), "memory", None)
            .expect("valid memory limit");
        assert_eq!(limit.bytes(), 64 * 1024 * 1024);
    }

    #[test]
    fn test_io_bps_bounds() {
        assert!(IoBps::validate(Some(0), "io", None).is_ok());
        assert!(IoBps::validate(Some(i32::MAX), "io", None).is_ok());
        assert!(IoBps::validate(Some(-1), "io", None).is_err());
    }

    #[test]
    fn test_io_device_parsing() {
        let device: IoDevice = "8:0".parse().expect("valid device");
        assert_eq!(device.major(), 8);
        assert_eq!(device.minor(), 0);
        assert_eq!(device.to_string(), "8:0");

        assert!("sda".parse::<IoDevice>().is_err());
        assert!("8:x".parse::<IoDevice>().is_err());
    }
}
