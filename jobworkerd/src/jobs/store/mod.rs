/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The in-memory job registry with per-job output pub/sub.

pub use error::{Result, StoreError};
pub use job::{Job, JobLimits, JobSpec, JobStatus};
pub use job_id::JobId;
pub use job_store::JobStore;
pub use output_buffer::OutputBuffer;
pub use task::{
    JobSnapshot, JobUpdate, Subscriber, Task, PUBLISH_TIMEOUT,
    SUBSCRIBER_MAILBOX_CAPACITY,
};

mod error;
mod job;
mod job_id;
mod job_store;
mod output_buffer;
mod task;
