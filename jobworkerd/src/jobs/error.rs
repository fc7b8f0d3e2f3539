/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use super::auth::AuthError;
use super::cgroups::CgroupsError;
use super::process::{ProcessError, SupervisorError};
use super::store::StoreError;
use thiserror::Error;
use tonic::Status;
use tracing::error;

#[derive(Debug, Error)]
pub(crate) enum JobServiceError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cgroups(#[from] CgroupsError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<SupervisorError> for JobServiceError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Store(e) => Self::Store(e),
            SupervisorError::Cgroups(e) => Self::Cgroups(e),
            SupervisorError::Process(e) => Self::Process(e),
        }
    }
}

impl From<JobServiceError> for Status {
    fn from(err: JobServiceError) -> Self {
        let msg = err.to_string();
        error!("{msg}");
        match err {
            JobServiceError::Auth(_) => Status::permission_denied(msg),
            JobServiceError::Store(e) => match e {
                StoreError::JobNotFound { .. } => Status::not_found(msg),
                StoreError::NotRunning { .. } => {
                    Status::failed_precondition(msg)
                }
                StoreError::IllegalTransition { .. }
                | StoreError::StopRequested { .. }
                | StoreError::IdExhausted => Status::internal(msg),
            },
            JobServiceError::Cgroups(e) => match e {
                CgroupsError::ControllerMissing { .. } => {
                    Status::unavailable(msg)
                }
                CgroupsError::CreateCgroup { .. }
                | CgroupsError::WriteLimit { .. }
                | CgroupsError::AttachProcess { .. }
                | CgroupsError::DeleteCgroup { .. } => Status::internal(msg),
            },
            JobServiceError::Process(e) => match e {
                ProcessError::CommandNotFound { .. }
                | ProcessError::TooManyEnvironmentVariables { .. }
                | ProcessError::InvalidEnvironmentVariable { .. } => {
                    Status::invalid_argument(msg)
                }
                ProcessError::InitBinaryNotExecutable { .. } => {
                    Status::failed_precondition(msg)
                }
                ProcessError::LaunchTimedOut { .. } => {
                    Status::deadline_exceeded(msg)
                }
                ProcessError::FailedToLaunch { .. }
                | ProcessError::FailedToSignal { .. }
                | ProcessError::RefusedToDie { .. }
                | ProcessError::WaitFailed { .. } => Status::internal(msg),
            },
        }
    }
}
