/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Per-job cgroup v2 management: create, limit, attach, clean up.

pub use cgroup::{Cgroup, CLEANUP_TIMEOUT};
pub(crate) use cgroup::job_dir;
pub use error::{CgroupsError, Result};
pub use limits::{CpuPercent, IoBps, IoDevice, MemoryMb};

mod cgroup;
mod error;
mod limits;

/// Default cgroup v2 slice under which per-job directories are created. The
/// parent must have the cpu and memory controllers delegated.
pub const DEFAULT_CGROUP_BASE: &str = "/sys/fs/cgroup/jobworkerd.slice";
