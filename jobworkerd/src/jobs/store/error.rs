/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use super::{JobId, JobStatus};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job '{job_id}' not found")]
    JobNotFound { job_id: JobId },
    #[error("job '{job_id}' is {status}, not RUNNING")]
    NotRunning { job_id: JobId, status: JobStatus },
    #[error("job '{job_id}' cannot transition from {from} to {to}")]
    IllegalTransition { job_id: JobId, from: JobStatus, to: JobStatus },
    #[error("job '{job_id}' was stopped before it started running")]
    StopRequested { job_id: JobId },
    #[error("failed to allocate a unique job id")]
    IdExhausted,
}
