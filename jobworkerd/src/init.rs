/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Init mode: the second stage of the two-stage launch.
//!
//! The supervisor cannot exec the user's command directly because /proc and
//! cgroup membership must be arranged between fork and exec. It therefore
//! re-invokes this binary with [INIT_MODE_ENV] set inside the fresh
//! namespaces; this tiny stage finishes the setup and replaces itself with
//! the user command. It has no RPC surface and must stay minimal.

use nix::mount::{mount, MsFlags};
use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::path::Path;

/// Environment variable selecting init mode. Checked before anything else in
/// main, including the tokio runtime.
pub const INIT_MODE_ENV: &str = "JOB_WORKER_INIT";

/// Exit code for any failure before execve, distinguishing setup failures
/// from the user command's own exit codes.
pub const INIT_FAILURE_EXIT_CODE: i32 = 127;

pub fn in_init_mode() -> bool {
    env::var_os(INIT_MODE_ENV).is_some()
}

/// Runs the init stage. Never returns: on success the process image is
/// replaced by the user command, on failure the process exits with
/// [INIT_FAILURE_EXIT_CODE].
pub fn run() -> ! {
    match setup_and_exec() {
        Ok(infallible) => match infallible {},
        Err(e) => {
            // Stderr is wired to the job's output pipe, so the failure is
            // visible in the job's retained output.
            eprintln!("jobworkerd init: {e}");
            std::process::exit(INIT_FAILURE_EXIT_CODE);
        }
    }
}

fn setup_and_exec() -> Result<Infallible, String> {
    remount_proc()?;
    join_cgroup()?;
    exec_command()
}

/// Gives the new pid namespace a truthful /proc. The recursive private
/// propagation keeps the fresh mount from leaking to the host.
fn remount_proc() -> Result<(), String> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| format!("failed to make mounts private: {e}"))?;

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| format!("failed to mount /proc: {e}"))?;

    Ok(())
}

/// Joins the cgroup assigned by the supervisor before user code runs.
/// Writing pid 0 moves the writing process, which sidesteps the pid
/// translation between namespaces.
fn join_cgroup() -> Result<(), String> {
    let cgroup_path = env::var("JOB_CGROUP_PATH")
        .map_err(|_| "JOB_CGROUP_PATH is not set".to_string())?;

    let procs = Path::new(&cgroup_path).join("cgroup.procs");
    std::fs::write(&procs, "0")
        .map_err(|e| format!("failed to join cgroup '{cgroup_path}': {e}"))
}

fn exec_command() -> Result<Infallible, String> {
    let command = env::var("JOB_COMMAND")
        .map_err(|_| "JOB_COMMAND is not set".to_string())?;
    let args_count: usize = env::var("JOB_ARGS_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut argv = Vec::with_capacity(args_count + 1);
    argv.push(
        CString::new(command.clone())
            .map_err(|_| "JOB_COMMAND contains a NUL byte".to_string())?,
    );
    for i in 0..args_count {
        let arg = env::var(format!("JOB_ARG_{i}"))
            .map_err(|_| format!("JOB_ARG_{i} is not set"))?;
        argv.push(
            CString::new(arg)
                .map_err(|_| format!("JOB_ARG_{i} contains a NUL byte"))?,
        );
    }

    // execv, not execvp: the supervisor already resolved the command to an
    // absolute path.
    match nix::unistd::execv(&argv[0], &argv) {
        Err(e) => Err(format!("failed to exec '{command}': {e}")),
        Ok(infallible) => match infallible {},
    }
}
