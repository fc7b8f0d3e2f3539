/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use crate::jobs::cgroups::CgroupsError;
use crate::jobs::store::{JobId, StoreError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("command '{command}' not found in PATH or common locations")]
    CommandNotFound { command: String },
    #[error("init binary '{path}' is not an executable regular file")]
    InitBinaryNotExecutable { path: PathBuf },
    #[error("environment has {count} variables (max {max})")]
    TooManyEnvironmentVariables { count: usize, max: usize },
    #[error("environment variable '{name}' is invalid: {reason}")]
    InvalidEnvironmentVariable { name: String, reason: &'static str },
    #[error("job '{job_id}' failed to launch: {source}")]
    FailedToLaunch { job_id: JobId, source: io::Error },
    #[error("job '{job_id}' did not reach RUNNING within the launch deadline")]
    LaunchTimedOut { job_id: JobId },
    #[error("failed to signal pid {pid}: {source}")]
    FailedToSignal { pid: i32, source: io::Error },
    #[error("pid {pid} is still alive after SIGKILL")]
    RefusedToDie { pid: i32 },
    #[error("failed to reap pid {pid}: {source}")]
    WaitFailed { pid: i32, source: io::Error },
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// Everything that can go wrong between a validated request and a terminal
/// job state.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cgroups(#[from] CgroupsError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}
