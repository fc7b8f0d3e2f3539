/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The job execution engine: the store (registry + output pub/sub), the
//! cgroup resource controller, the process supervisor, and the gRPC facade
//! tying them together.

pub use job_service::{JobService, MAX_STREAM_CHUNK_SIZE};

pub mod auth;
pub mod cgroups;
pub mod process;
pub mod store;
pub mod validation;

mod error;
mod job_service;

use self::cgroups::{CpuPercent, IoBps, MemoryMb};

/// Server-side substitutes for limits a caller leaves at zero. The source of
/// truth is the daemon configuration, not a constant baked in here.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    pub cpu_percent: CpuPercent,
    pub memory_mb: MemoryMb,
    pub io_bytes_per_sec: IoBps,
}

impl JobDefaults {
    pub fn new(
        cpu_percent: i32,
        memory_mb: i32,
        io_bytes_per_sec: i32,
    ) -> Result<Self, ::validation::ValidationError> {
        use ::validation::ValidatedField;

        Ok(Self {
            cpu_percent: CpuPercent::validate(
                Some(cpu_percent),
                "default_cpu_percent",
                None,
            )?,
            memory_mb: MemoryMb::validate(
                Some(memory_mb),
                "default_memory_mb",
                None,
            )?,
            io_bytes_per_sec: IoBps::validate(
                Some(io_bytes_per_sec),
                "default_io_bps",
                None,
            )?,
        })
    }
}
