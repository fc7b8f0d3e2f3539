/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::error::{ProcessError, Result};
use crate::init;
use crate::jobs::store::JobId;
use nix::unistd::Pid;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::error;

pub const MAX_ENVIRONMENT_VARS: usize = 1000;
pub const MAX_ENVIRONMENT_VAR_LEN: usize = 8192;

/// Everything the launch thread needs to start one job's init stage.
#[derive(Debug)]
pub struct LaunchSpec {
    pub job_id: JobId,
    /// Resolved absolute path of the user command.
    pub command: PathBuf,
    pub args: Vec<String>,
    pub cgroup_path: PathBuf,
    /// The binary re-invoked in init mode, normally this daemon itself.
    pub init_binary: PathBuf,
}

/// A child created by [launch]: its pid, the pidfd from clone3, and the read
/// end of the merged stdout/stderr pipe.
#[derive(Debug)]
pub struct LaunchedChild {
    pub pid: Pid,
    #[allow(unused)]
    pub pidfd: OwnedFd,
    pub output: OwnedFd,
}

/// Starts the two-stage launch: clone3 into fresh pid/mount/ipc/uts/cgroup
/// namespaces (host networking is shared by design), then exec this binary in
/// init mode. The init stage remounts /proc, joins the job's cgroup and execs
/// the user command, so cgroup membership is in place before user code runs.
///
/// Must be called from a thread that stays put for the duration of the clone;
/// the supervisor runs it on a dedicated blocking thread.
pub fn launch(spec: &LaunchSpec) -> Result<LaunchedChild> {
    let job_env = build_job_environment(spec);
    validate_environment(&job_env)?;

    let map_io = |source: io::Error| ProcessError::FailedToLaunch {
        job_id: spec.job_id.clone(),
        source,
    };

    // One pipe carries both stdout and stderr, merged in arrival order.
    let (pipe_read, pipe_write) = nix::unistd::pipe()
        .map_err(|e| map_io(io::Error::from_raw_os_error(e as i32)))?;
    let stderr_write = pipe_write.try_clone().map_err(|e| map_io(e))?;

    let mut command = Command::new(&spec.init_binary);
    let _ = command
        .envs(job_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(pipe_write))
        .stderr(Stdio::from(stderr_write));

    unsafe {
        let _ = command.pre_exec(|| {
            // Fresh process group so the whole job tree can be signaled with
            // a negative pid.
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    // Clone docs: https://man7.org/linux/man-pages/man2/clone.2.html
    let mut pidfd = -1;
    let mut clone = clone3::Clone3::default();
    let _ = clone.flag_pidfd(&mut pidfd);
    let _ = clone.exit_signal(nix::libc::SIGCHLD as u64);
    let _ = clone.flag_newpid();
    let _ = clone.flag_newns();
    let _ = clone.flag_newipc();
    let _ = clone.flag_newuts();
    let _ = clone.flag_newcgroup();
    // No flag_newnet: jobs share host networking.

    match unsafe { clone.call() }
        .map_err(|e| map_io(io::Error::from_raw_os_error(e.0)))?
    {
        0 => {
            // Child: replace this image with the init-mode re-invocation.
            // exec only returns on failure.
            let e = command.exec();
            error!("failed to exec init stage: {e}");
            std::process::exit(init::INIT_FAILURE_EXIT_CODE);
        }
        pid => {
            // Parent. The command still owns the pipe write ends; drop it so
            // the reader sees EOF once the child exits.
            drop(command);

            let _ = procfs::process::Process::new(pid).map_err(|e| {
                map_io(io::Error::new(io::ErrorKind::Other, e))
            })?;

            Ok(LaunchedChild {
                pid: Pid::from_raw(pid),
                pidfd: unsafe { OwnedFd::from_raw_fd(pidfd) },
                output: pipe_read,
            })
        }
    }
}

/// The environment contract of the init-mode child. The parent environment is
/// inherited; these entries are injected on top.
fn build_job_environment(spec: &LaunchSpec) -> Vec<(String, String)> {
    let mut env = vec![
        (init::INIT_MODE_ENV.to_string(), "1".to_string()),
        ("JOB_ID".to_string(), spec.job_id.to_string()),
        ("JOB_COMMAND".to_string(), spec.command.display().to_string()),
        (
            "JOB_CGROUP_PATH".to_string(),
            spec.cgroup_path.display().to_string(),
        ),
    ];

    for (i, arg) in spec.args.iter().enumerate() {
        env.push((format!("JOB_ARG_{i}"), arg.clone()));
    }
    env.push(("JOB_ARGS_COUNT".to_string(), spec.args.len().to_string()));

    env
}

/// Validates the environment the child will see: the inherited variables plus
/// the injected contract.
fn validate_environment(injected: &[(String, String)]) -> Result<()> {
    let inherited = std::env::vars_os().count();
    let count = inherited + injected.len();
    if count > MAX_ENVIRONMENT_VARS {
        return Err(ProcessError::TooManyEnvironmentVariables {
            count,
            max: MAX_ENVIRONMENT_VARS,
        });
    }

    for (name, value) in injected {
        if name.is_empty() {
            return Err(ProcessError::InvalidEnvironmentVariable {
                name: name.clone(),
                reason: "name is empty",
            });
        }
        if name.contains('=') {
            return Err(ProcessError::InvalidEnvironmentVariable {
                name: name.clone(),
                reason: "name contains '='",
            });
        }
        if name.contains('\0') || value.contains('\0') {
            return Err(ProcessError::InvalidEnvironmentVariable {
                name: name.clone(),
                reason: "contains a NUL byte",
            });
        }
        // name=value, as the kernel sees it
        if name.len() + 1 + value.len() > MAX_ENVIRONMENT_VAR_LEN {
            return Err(ProcessError::InvalidEnvironmentVariable {
                name: name.clone(),
                reason: "entry exceeds the length limit",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for_tests(args: Vec<String>) -> LaunchSpec {
        LaunchSpec {
            job_id: JobId::from("test-job"),
            command: PathBuf::from("/bin/echo"),
            args,
            cgroup_path: PathBuf::from(
                "/sys/fs/cgroup/jobworkerd.slice/job-test-job",
            ),
            init_binary: PathBuf::from("/proc/self/exe"),
        }
    }

    #[test]
    fn test_environment_contract() {
        let spec = spec_for_tests(vec!["hello".into(), "world".into()]);
        let env = build_job_environment(&spec);

        let get = |name: &str| {
            env.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or_else(|| panic!("missing env var {name}"))
        };

        assert_eq!(get("JOB_ID"), "test-job");
        assert_eq!(get("JOB_COMMAND"), "/bin/echo");
        assert_eq!(
            get("JOB_CGROUP_PATH"),
            "/sys/fs/cgroup/jobworkerd.slice/job-test-job"
        );
        assert_eq!(get("JOB_ARG_0"), "hello");
        assert_eq!(get("JOB_ARG_1"), "world");
        assert_eq!(get("JOB_ARGS_COUNT"), "2");
        assert_eq!(get(init::INIT_MODE_ENV), "1");
    }

    #[test]
    fn test_environment_entry_length_limit() {
        let oversized = "x".repeat(MAX_ENVIRONMENT_VAR_LEN);
        let env = vec![("JOB_ARG_0".to_string(), oversized)];
        assert!(matches!(
            validate_environment(&env),
            Err(ProcessError::InvalidEnvironmentVariable { .. })
        ));
    }

    #[test]
    fn test_environment_name_rules() {
        for (name, value) in [
            ("", "v"),
            ("A=B", "v"),
            ("NUL", "has\0nul"),
        ] {
            let env = vec![(name.to_string(), value.to_string())];
            assert!(
                validate_environment(&env).is_err(),
                "expected ('{name}', {value:?}) to be rejected"
            );
        }
    }

    #[test]
    fn test_environment_within_limits_is_accepted() {
        let spec = spec_for_tests(vec!["ok".into()]);
        let env = build_job_environment(&spec);
        assert!(validate_environment(&env).is_ok());
    }
}
