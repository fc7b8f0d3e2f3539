/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::JobId;
use crate::jobs::cgroups::{CpuPercent, IoBps, MemoryMb};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::SystemTime;

/// Lifecycle state of a job.
///
/// ```text
///        create_pending
///  (none) ───────────► INITIALIZING
///                          │
///                  launch-ok│       launch-fail / stop-before-run
///                          ▼        ────────────► FAILED
///                       RUNNING
///            normal exit │    │ stop / fatal signal
///                        ▼    ▼
///                   COMPLETED/FAILED   STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Legal edges of the state machine. Everything else is a bug in the
    /// caller and is rejected by the store.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Initializing, Self::Running) => true,
            (Self::Initializing, Self::Failed) => true,
            (Self::Running, Self::Completed)
            | (Self::Running, Self::Failed)
            | (Self::Running, Self::Stopped) => true,
            _ => false,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Resource limits requested for a job. Zero means "server default" for CPU
/// and memory, and "unlimited" for IO. Values are validated at the RPC
/// boundary before a spec reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobLimits {
    pub cpu_percent: CpuPercent,
    pub memory_mb: MemoryMb,
    pub io_bytes_per_sec: IoBps,
}

/// A validated request to run one command.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub command: String,
    pub args: Vec<String>,
    pub limits: JobLimits,
}

/// The job record. The authoritative copy lives inside the store's per-job
/// task; everything handed out is a point-in-time clone.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub limits: JobLimits,
    pub status: JobStatus,
    pub pid: i32,
    pub exit_code: Option<i32>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub cgroup_path: Option<PathBuf>,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        let JobSpec { command, args, limits } = spec;
        Self {
            id,
            command,
            args,
            limits,
            status: JobStatus::Initializing,
            pid: 0,
            exit_code: None,
            start_time: None,
            end_time: None,
            cgroup_path: None,
        }
    }
}
