/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::error::{ProcessError, SupervisorResult};
use super::launcher::{self, LaunchSpec};
use super::output_writer::{spawn_output_pump, OutputWriter};
use super::resolver;
use crate::jobs::cgroups::{self, Cgroup, IoDevice};
use crate::jobs::store::{Job, JobId, JobSpec, JobStatus, JobStore, Task};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Hard deadline from spawn to RUNNING.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default window between SIGTERM and SIGKILL on stop. Deliberately short for
/// tests; production deployments raise it via `--stop-grace-period-ms`.
pub const DEFAULT_GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after SIGKILL before probing whether the process is finally gone.
const SIGKILL_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// How long a stop waits for the waiter task to record the terminal state.
const TERMINAL_OBSERVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code recorded when a job never produced one (setup failure, reap
/// failure).
pub const EXIT_CODE_UNKNOWN: i32 = -1;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Cgroup v2 slice holding the per-job directories.
    pub cgroup_base: PathBuf,
    /// Block device for io.max entries; IO limiting is skipped without one.
    pub io_device: Option<IoDevice>,
    /// SIGTERM grace window before SIGKILL on stop.
    pub graceful_stop_timeout: Duration,
    /// Binary re-invoked as the init stage, normally this daemon.
    pub init_binary: PathBuf,
}

/// Turns validated job specs into supervised, isolated OS processes and
/// ultimately terminal job states. One waiter task per running job reaps the
/// exit status; cgroup cleanup runs on bounded background tasks.
#[derive(Debug)]
pub struct Supervisor {
    store: Arc<JobStore>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(store: Arc<JobStore>, config: SupervisorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Launches a job: registers it INITIALIZING, creates its cgroup, starts
    /// the isolated child and marks it RUNNING. Any failure on the way marks
    /// the job FAILED, cleans up, and surfaces the error.
    #[tracing::instrument(skip(self, spec), fields(command = %spec.command))]
    pub async fn launch(&self, spec: JobSpec) -> SupervisorResult<Job> {
        // Resolution happens before any side effect.
        let resolved = resolver::resolve_command(&spec.command)?;

        let (job_id, task) = self.store.create_pending(spec)?;
        let cgroup_path = cgroups::job_dir(&self.config.cgroup_base, &job_id);
        task.set_cgroup_path(cgroup_path.clone());

        match self.launch_inner(&job_id, &task, resolved).await {
            Ok(()) => Ok(task.job()),
            Err(e) => {
                warn!(%job_id, "launch failed: {e}");
                if let Err(mark_err) = task
                    .mark_terminal(
                        JobStatus::Failed,
                        EXIT_CODE_UNKNOWN,
                        SystemTime::now(),
                    )
                    .await
                {
                    error!(%job_id, "failed to record launch failure: {mark_err}");
                }
                Cgroup::schedule_cleanup(cgroup_path);
                Err(e)
            }
        }
    }

    async fn launch_inner(
        &self,
        job_id: &JobId,
        task: &Arc<Task>,
        resolved: PathBuf,
    ) -> SupervisorResult<()> {
        let job = task.job();
        let cgroup = Cgroup::create(
            &self.config.cgroup_base,
            job_id,
            &job.limits,
            self.config.io_device.as_ref(),
        )?;

        let launch_spec = LaunchSpec {
            job_id: job_id.clone(),
            command: resolved,
            args: job.args,
            cgroup_path: cgroup.path().to_path_buf(),
            init_binary: self.config.init_binary.clone(),
        };

        // Namespace setup acts on the calling kernel thread; the dedicated
        // blocking thread keeps the clone pinned for the duration.
        let mut launch =
            tokio::task::spawn_blocking(move || launcher::launch(&launch_spec));

        let launched = match timeout(LAUNCH_TIMEOUT, &mut launch).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => {
                return Err(ProcessError::FailedToLaunch {
                    job_id: job_id.clone(),
                    source: io::Error::new(io::ErrorKind::Other, join_error),
                }
                .into());
            }
            Err(_elapsed) => {
                // The blocking launch may still complete; reap whatever
                // arrives late so no child leaks.
                let _ = tokio::spawn(async move {
                    if let Ok(Ok(child)) = launch.await {
                        abort_child(child.pid);
                    }
                });
                return Err(ProcessError::LaunchTimedOut {
                    job_id: job_id.clone(),
                }
                .into());
            }
        };

        let pid = launched.pid;

        // The init stage joins the cgroup itself before exec; this
        // parent-side attach covers the window where the child dies first.
        if let Err(e) = cgroup.attach(pid) {
            abort_child(pid);
            return Err(e.into());
        }

        if let Err(e) = task.mark_running(pid.as_raw(), SystemTime::now()) {
            // A stop raced the launch; the job never ran user code.
            debug!(%job_id, "aborting launch: {e}");
            abort_child(pid);
            return Err(e.into());
        }

        info!(%job_id, pid = pid.as_raw(), "job running");

        let writer = OutputWriter::new(self.store.clone(), job_id.clone());
        let _pump = spawn_output_pump(writer, launched.output);

        self.spawn_waiter(
            job_id.clone(),
            task.clone(),
            pid,
            cgroup.path().to_path_buf(),
        );

        Ok(())
    }

    /// One dedicated waiter per running job: reap the exit status, record the
    /// terminal state, broadcast to subscribers, schedule cgroup cleanup.
    fn spawn_waiter(
        &self,
        job_id: JobId,
        task: Arc<Task>,
        pid: Pid,
        cgroup_path: PathBuf,
    ) {
        let _ = tokio::spawn(async move {
            let outcome =
                tokio::task::spawn_blocking(move || wait_for_exit(pid)).await;

            let (status, exit_code) = match outcome {
                Ok(Ok(exit)) => classify_exit(exit, task.stop_requested()),
                Ok(Err(source)) => {
                    let e = ProcessError::WaitFailed {
                        pid: pid.as_raw(),
                        source,
                    };
                    error!(%job_id, "{e}");
                    (JobStatus::Failed, EXIT_CODE_UNKNOWN)
                }
                Err(join_error) => {
                    // A panic in the waiter is contained to this job.
                    error!(%job_id, "waiter task failed: {join_error}");
                    (JobStatus::Failed, EXIT_CODE_UNKNOWN)
                }
            };

            if let Err(e) =
                task.mark_terminal(status, exit_code, SystemTime::now()).await
            {
                error!(%job_id, "failed to record terminal state: {e}");
            }

            info!(%job_id, %status, exit_code, "job finished");

            Cgroup::schedule_cleanup(cgroup_path);
        });
    }

    /// Stops a job. Synchronous from the caller's point of view and
    /// idempotent: stopping a finished job reports its current state, and
    /// concurrent stops deliver at most one signal ladder.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, job_id: &JobId) -> SupervisorResult<Job> {
        let task = self.store.get(job_id)?;
        let (status, already_requested) = task.request_stop();

        match status {
            JobStatus::Initializing => {
                // The launch path aborts when it observes the flag.
                let _ = timeout(TERMINAL_OBSERVE_TIMEOUT, task.wait_terminal())
                    .await;
                Ok(task.job())
            }
            JobStatus::Running => {
                if !already_requested {
                    let pid = task.job().pid;
                    self.terminate_process(pid).await?;
                }

                match timeout(TERMINAL_OBSERVE_TIMEOUT, task.wait_terminal())
                    .await
                {
                    Ok(_) => Ok(task.job()),
                    Err(_) => Err(ProcessError::RefusedToDie {
                        pid: task.job().pid,
                    }
                    .into()),
                }
            }
            _terminal => Ok(task.job()),
        }
    }

    /// SIGTERM to the process group, a grace window, then SIGKILL. Still
    /// alive after SIGKILL is an internal error.
    async fn terminate_process(&self, pid: i32) -> Result<(), ProcessError> {
        debug!(pid, "sending SIGTERM");
        signal_process_tree(pid, Signal::SIGTERM)?;

        tokio::time::sleep(self.config.graceful_stop_timeout).await;
        if !is_process_alive(pid) {
            return Ok(());
        }

        warn!(pid, "graceful stop window expired, sending SIGKILL");
        signal_process_tree(pid, Signal::SIGKILL)?;

        tokio::time::sleep(SIGKILL_SETTLE_DELAY).await;
        if is_process_alive(pid) {
            return Err(ProcessError::RefusedToDie { pid });
        }

        Ok(())
    }

    /// Stops every job that is still alive. Called on daemon shutdown; jobs
    /// do not survive the daemon.
    pub async fn shutdown_all(&self) {
        for task in self.store.tasks() {
            let job = task.job();
            if job.status.is_terminal() {
                continue;
            }
            if let Err(e) = self.stop(&job.id).await {
                warn!(job_id = %job.id, "failed to stop job on shutdown: {e}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ExitKind {
    Code(i32),
    Signaled(Signal),
}

fn wait_for_exit(pid: Pid) -> io::Result<ExitKind> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitKind::Code(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ExitKind::Signaled(signal))
            }
            // Stopped/continued and other intermediate states are not exits.
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

/// Maps an exit to the terminal state: clean exit 0 is COMPLETED, non-zero is
/// FAILED, and a job terminated by signal or by an operator stop is STOPPED
/// with the conventional 128+signal encoding.
fn classify_exit(exit: ExitKind, stop_requested: bool) -> (JobStatus, i32) {
    match exit {
        ExitKind::Signaled(signal) => {
            (JobStatus::Stopped, 128 + signal as i32)
        }
        ExitKind::Code(code) if stop_requested => (JobStatus::Stopped, code),
        ExitKind::Code(0) => (JobStatus::Completed, 0),
        ExitKind::Code(code) => (JobStatus::Failed, code),
    }
}

/// Signals the whole process group via the negated pid, falling back to the
/// main pid when the group is gone. A process that is already dead counts as
/// successfully signaled.
fn signal_process_tree(pid: i32, signal: Signal) -> Result<(), ProcessError> {
    match kill(Pid::from_raw(-pid), signal) {
        Ok(()) => Ok(()),
        Err(Errno::EPERM) | Err(Errno::ESRCH) => {
            match kill(Pid::from_raw(pid), signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(ProcessError::FailedToSignal {
                    pid,
                    source: io::Error::from_raw_os_error(e as i32),
                }),
            }
        }
        Err(e) => Err(ProcessError::FailedToSignal {
            pid,
            source: io::Error::from_raw_os_error(e as i32),
        }),
    }
}

/// Liveness probe: signal 0 delivers nothing but reports reachability.
/// ESRCH means dead, EPERM means alive under another uid.
pub(crate) fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(e) => {
            debug!(pid, "liveness probe errored, assuming dead: {e}");
            false
        }
    }
}

/// Kills and reaps a child that must not run (failed attach, stop raced the
/// launch). Best effort.
fn abort_child(pid: Pid) {
    let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
    let _ = kill(pid, Signal::SIGKILL);
    let _ = tokio::task::spawn_blocking(move || {
        let _ = waitpid(pid, None);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{JobLimits, StoreError};

    fn supervisor_for_tests() -> Supervisor {
        let store = Arc::new(JobStore::new(0));
        Supervisor::new(
            store,
            SupervisorConfig {
                cgroup_base: PathBuf::from("/sys/fs/cgroup/jobworkerd.slice"),
                io_device: None,
                graceful_stop_timeout: DEFAULT_GRACEFUL_STOP_TIMEOUT,
                init_binary: PathBuf::from("/proc/self/exe"),
            },
        )
    }

    fn spec_for_tests(command: &str) -> JobSpec {
        JobSpec {
            command: command.into(),
            args: vec![],
            limits: JobLimits::default(),
        }
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(
            classify_exit(ExitKind::Code(0), false),
            (JobStatus::Completed, 0)
        );
        assert_eq!(
            classify_exit(ExitKind::Code(3), false),
            (JobStatus::Failed, 3)
        );
        assert_eq!(
            classify_exit(ExitKind::Signaled(Signal::SIGKILL), false),
            (JobStatus::Stopped, 137)
        );
        assert_eq!(
            classify_exit(ExitKind::Signaled(Signal::SIGTERM), true),
            (JobStatus::Stopped, 143)
        );
        // Exited cleanly, but only because it was asked to stop.
        assert_eq!(
            classify_exit(ExitKind::Code(0), true),
            (JobStatus::Stopped, 0)
        );
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id() as i32));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-42));
        // Pid beyond the default pid_max is never allocated.
        assert!(!is_process_alive(4_500_000));
    }

    #[tokio::test]
    async fn test_stop_unknown_job_is_not_found() {
        let supervisor = supervisor_for_tests();
        let result = supervisor.stop(&JobId::random()).await;
        assert!(matches!(
            result,
            Err(super::super::error::SupervisorError::Store(
                StoreError::JobNotFound { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_stop_terminal_job_reports_current_status() {
        let supervisor = supervisor_for_tests();
        let (job_id, task) = supervisor
            .store()
            .create_pending(spec_for_tests("/bin/true"))
            .expect("create");
        task.mark_running(99_999, SystemTime::now()).expect("running");
        task.mark_terminal(JobStatus::Completed, 0, SystemTime::now())
            .await
            .expect("terminal");

        let job = supervisor.stop(&job_id).await.expect("idempotent stop");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));

        // A second stop returns the very same terminal state.
        let again = supervisor.stop(&job_id).await.expect("second stop");
        assert_eq!(again.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_launch_rejects_unresolvable_command() {
        let supervisor = supervisor_for_tests();
        let result = supervisor
            .launch(spec_for_tests("no-such-binary-on-any-host"))
            .await;
        assert!(matches!(
            result,
            Err(super::super::error::SupervisorError::Process(
                ProcessError::CommandNotFound { .. }
            ))
        ));
        // Validation failures leave no trace in the store.
        assert!(supervisor.store().list().is_empty());
    }

    // Ignored: requires root, cgroup v2 delegation, and clone permissions
    // (Docker's default seccomp profile blocks clone3).
    #[ignore]
    #[tokio::test]
    async fn test_launch_happy_path_echo() {
        let supervisor = supervisor_for_tests();
        let mut spec = spec_for_tests("/bin/echo");
        spec.args = vec!["hi".into()];

        let job = supervisor.launch(spec).await.expect("launch");
        assert!(matches!(
            job.status,
            JobStatus::Running | JobStatus::Completed
        ));

        let task = supervisor.store().get(&job.id).expect("task");
        let status = task.wait_terminal().await;
        assert_eq!(status, JobStatus::Completed);

        let snapshot = supervisor.store().snapshot(&job.id).expect("snapshot");
        assert_eq!(&snapshot.output[..], b"hi\n");
        assert_eq!(snapshot.job.exit_code, Some(0));
    }

    // Ignored: requires root, cgroup v2 delegation, and clone permissions.
    #[ignore]
    #[tokio::test]
    async fn test_stop_running_sleep() {
        let supervisor = supervisor_for_tests();
        let mut spec = spec_for_tests("/bin/sleep");
        spec.args = vec!["30".into()];

        let job = supervisor.launch(spec).await.expect("launch");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopped = supervisor.stop(&job.id).await.expect("stop");
        assert_eq!(stopped.status, JobStatus::Stopped);
        assert!(stopped.end_time >= stopped.start_time);
    }
}
