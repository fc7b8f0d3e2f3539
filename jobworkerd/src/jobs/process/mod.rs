/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Process supervision: validation, command resolution, the two-stage
//! namespace launch, termination, and the output pump.

pub use error::{ProcessError, Result, SupervisorError, SupervisorResult};
pub use launcher::{
    LaunchSpec, LaunchedChild, MAX_ENVIRONMENT_VARS, MAX_ENVIRONMENT_VAR_LEN,
};
pub use output_writer::{spawn_output_pump, OutputWriter};
pub use resolver::{resolve_command, validate_init_binary};
pub use supervisor::{
    Supervisor, SupervisorConfig, DEFAULT_GRACEFUL_STOP_TIMEOUT,
    EXIT_CODE_UNKNOWN, LAUNCH_TIMEOUT,
};

mod error;
mod launcher;
mod output_writer;
mod resolver;
mod supervisor;
