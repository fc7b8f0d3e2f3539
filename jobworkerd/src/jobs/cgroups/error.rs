/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CgroupsError>;

#[derive(Error, Debug)]
pub enum CgroupsError {
    #[error("failed to create cgroup '{path}': {source}")]
    CreateCgroup { path: PathBuf, source: io::Error },
    #[error("cgroup '{path}' has no {controller} controller delegated")]
    ControllerMissing { path: PathBuf, controller: &'static str },
    #[error("failed to write limit file '{path}': {source}")]
    WriteLimit { path: PathBuf, source: io::Error },
    #[error("failed to attach pid {pid} to cgroup '{path}': {source}")]
    AttachProcess { path: PathBuf, pid: i32, source: io::Error },
    #[error("failed to delete cgroup '{path}': {source}")]
    DeleteCgroup { path: PathBuf, source: io::Error },
}
