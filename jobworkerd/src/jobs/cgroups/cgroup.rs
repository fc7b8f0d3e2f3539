/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::error::{CgroupsError, Result};
use super::limits::IoDevice;
use crate::jobs::store::{JobId, JobLimits};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Bound on the background cleanup of one cgroup.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between SIGTERM and SIGKILL when clearing leftover pids.
const PROC_TERMINATION_GRACE: Duration = Duration::from_millis(100);

/// One cgroup v2 directory, `<base>/job-<id>`, carrying the CPU, memory and
/// (best effort) IO limits of a single job.
///
/// The raw file interface at /sys/fs/cgroup is used directly; the on-disk
/// formats are part of this daemon's contract.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Creates and configures the cgroup directory for a job. A stale
    /// directory left behind by a previous run is cleared first.
    ///
    /// Limits with value zero leave the kernel default in place. CPU and
    /// memory controllers are required when a limit is requested; the IO
    /// limit is written only when the operator configured a block device and
    /// failure to apply it is not fatal.
    pub fn create(
        base: &Path,
        job_id: &JobId,
        limits: &JobLimits,
        io_device: Option<&IoDevice>,
    ) -> Result<Self> {
        let path = job_dir(base, job_id);

        if path.exists() {
            warn!(path = %path.display(), "removing stale cgroup directory");
            cleanup_blocking(&path);
        }

        fs::create_dir_all(&path).map_err(|e| CgroupsError::CreateCgroup {
            path: path.clone(),
            source: e,
        })?;

        if let Err(e) = Self::apply_limits(&path, limits, io_device) {
            cleanup_blocking(&path);
            return Err(e);
        }

        debug!(
            path = %path.display(),
            cpu = %limits.cpu_percent,
            memory = %limits.memory_mb,
            "cgroup created"
        );

        Ok(Self { path })
    }

    fn apply_limits(
        path: &Path,
        limits: &JobLimits,
        io_device: Option<&IoDevice>,
    ) -> Result<()> {
        apply_cpu_limit(path, limits)?;
        apply_memory_limit(path, limits)?;
        apply_io_limit(path, limits, io_device);
        Ok(())
    }

    /// Moves a pid into this cgroup.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        let procs = self.path.join("cgroup.procs");
        fs::write(&procs, pid.as_raw().to_string()).map_err(|e| {
            CgroupsError::AttachProcess {
                path: self.path.clone(),
                pid: pid.as_raw(),
                source: e,
            }
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clears and removes the cgroup on a background task, bounded by
    /// [CLEANUP_TIMEOUT]. A cleanup that exceeds the bound is logged and
    /// abandoned; the next job with the same name tolerates the leftover by
    /// removing it first.
    pub fn schedule_cleanup(path: PathBuf) {
        let _ = tokio::spawn(async move {
            let path_display = path.display().to_string();
            let cleanup = tokio::task::spawn_blocking(move || {
                cleanup_blocking(&path);
            });

            match tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await {
                Ok(Ok(())) => trace!(path = %path_display, "cgroup cleanup completed"),
                Ok(Err(e)) => warn!(path = %path_display, "cgroup cleanup task failed: {e}"),
                Err(_) => warn!(path = %path_display, "cgroup cleanup timed out, abandoning"),
            }
        });
    }

    /// Startup sweep: jobs do not survive a daemon restart, so any `job-*`
    /// directory under the base is garbage. Leftover pids are killed and the
    /// directories removed.
    pub fn sweep_stale(base: &Path) {
        let entries = match fs::read_dir(base) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(base = %base.display(), "no cgroup base to sweep: {e}");
                return;
            }
        };

        let mut swept = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("job-") {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            cleanup_blocking(&path);
            swept += 1;
        }

        if swept > 0 {
            info!(base = %base.display(), swept, "reaped stale job cgroups");
        }
    }
}

pub(crate) fn job_dir(base: &Path, job_id: &JobId) -> PathBuf {
    base.join(format!("job-{job_id}"))
}

fn apply_cpu_limit(path: &Path, limits: &JobLimits) -> Result<()> {
    let cpu = limits.cpu_percent;
    if cpu.is_unlimited() {
        return Ok(());
    }

    // cpu.max format: "<quota_us> <period_us>", 100000us period so that
    // cpu_percent=100 equals one full core.
    let cpu_max = path.join("cpu.max");
    if cpu_max.exists() {
        let quota = i64::from(cpu.into_inner()) * 1000;
        let value = format!("{quota} 100000");
        fs::write(&cpu_max, &value).map_err(|e| CgroupsError::WriteLimit {
            path: cpu_max,
            source: e,
        })?;
        debug!(%cpu, %value, "set cpu.max");
        return Ok(());
    }

    // Fallback for hosts without the bandwidth controller.
    let cpu_weight = path.join("cpu.weight");
    if cpu_weight.exists() {
        let weight =
            (i64::from(cpu.into_inner()) * 100).clamp(1, 10_000).to_string();
        fs::write(&cpu_weight, &weight).map_err(|e| {
            CgroupsError::WriteLimit { path: cpu_weight, source: e }
        })?;
        debug!(%cpu, %weight, "set cpu.weight");
        return Ok(());
    }

    Err(CgroupsError::ControllerMissing {
        path: path.to_path_buf(),
        controller: "cpu",
    })
}

fn apply_memory_limit(path: &Path, limits: &JobLimits) -> Result<()> {
    let memory = limits.memory_mb;
    if memory.is_unlimited() {
        return Ok(());
    }

    let hard_limit = memory.bytes();
    let memory_max = path.join("memory.max");
    let memory_high = path.join("memory.high");

    let mut applied = false;

    if memory_max.exists() {
        fs::write(&memory_max, hard_limit.to_string()).map_err(|e| {
            CgroupsError::WriteLimit { path: memory_max, source: e }
        })?;
        applied = true;
    }

    if memory_high.exists() {
        // Soft limit at 90% of the hard limit so reclaim starts before the
        // OOM killer does.
        let soft_limit = (hard_limit as f64 * 0.9) as i64;
        fs::write(&memory_high, soft_limit.to_string()).map_err(|e| {
            CgroupsError::WriteLimit { path: memory_high, source: e }
        })?;
        applied = true;
    }

    if !applied {
        return Err(CgroupsError::ControllerMissing {
            path: path.to_path_buf(),
            controller: "memory",
        });
    }

    debug!(%memory, hard_limit, "set memory limits");
    Ok(())
}

/// IO limiting is best effort: it needs a real block device in major:minor
/// form, which only the operator knows. Without one, or when the kernel
/// rejects the write, the job simply runs unthrottled.
fn apply_io_limit(
    path: &Path,
    limits: &JobLimits,
    io_device: Option<&IoDevice>,
) {
    let io = limits.io_bytes_per_sec;
    if io.is_unlimited() {
        return;
    }

    let Some(device) = io_device else {
        warn!(
            %io,
            "io limit requested but no --io-device configured, continuing unthrottled"
        );
        return;
    };

    let io_max = path.join("io.max");
    let value =
        format!("{device} rbps={bps} wbps={bps}", bps = io.into_inner());
    match fs::write(&io_max, &value) {
        Ok(()) => debug!(%device, %value, "set io.max"),
        Err(e) => warn!(
            %device,
            %value,
            "kernel rejected io.max entry, continuing unthrottled: {e}"
        ),
    }
}

/// Kills any process still in the cgroup (SIGTERM, short grace, SIGKILL) and
/// removes the directory. Synchronous; callers bound it with a timeout when
/// latency matters.
pub(crate) fn cleanup_blocking(path: &Path) {
    if !path.exists() {
        return;
    }

    terminate_cgroup_procs(path);
    remove_cgroup_dir(path);
}

fn terminate_cgroup_procs(path: &Path) {
    let procs_path = path.join("cgroup.procs");
    let Ok(procs) = fs::read_to_string(&procs_path) else {
        return;
    };

    let pids: Vec<Pid> = procs
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect();

    if pids.is_empty() {
        return;
    }

    debug!(path = %path.display(), count = pids.len(), "terminating leftover cgroup processes");

    for pid in &pids {
        let _ = kill(*pid, Signal::SIGTERM);
    }

    std::thread::sleep(PROC_TERMINATION_GRACE);

    for pid in &pids {
        let _ = kill(*pid, Signal::SIGKILL);
    }
}

fn remove_cgroup_dir(path: &Path) {
    if let Err(e) = fs::remove_dir(path) {
        warn!(path = %path.display(), "failed to remove cgroup directory: {e}");

        // Writable interface files can pin the directory; remove them one by
        // one and retry. Files named cgroup.* are kernel-owned and skipped.
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if entry.path().is_dir()
                    || name.to_string_lossy().starts_with("cgroup.")
                {
                    continue;
                }
                let _ = fs::remove_file(entry.path());
            }
        }

        if let Err(e) = fs::remove_dir(path) {
            info!(
                path = %path.display(),
                "could not remove cgroup directory, a later start will retry: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("jobworkerd-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn test_job_dir_layout() {
        let job_id = JobId::from("abc-123");
        assert_eq!(
            job_dir(Path::new("/sys/fs/cgroup/jobworkerd.slice"), &job_id),
            PathBuf::from("/sys/fs/cgroup/jobworkerd.slice/job-abc-123")
        );
    }

    #[test]
    fn test_cleanup_removes_plain_directory() {
        let dir = scratch_dir();
        let target = dir.join("job-x");
        fs::create_dir_all(&target).expect("create");
        fs::write(target.join("io.max"), "x").expect("write");

        // remove_dir on a non-empty directory fails, which exercises the
        // file-by-file fallback.
        cleanup_blocking(&target);
        assert!(!target.exists());

        fs::remove_dir_all(&dir).expect("cleanup scratch");
    }

    #[test]
    fn test_sweep_stale_only_touches_job_directories() {
        let base = scratch_dir();
        fs::create_dir_all(base.join("job-old")).expect("create job dir");
        fs::create_dir_all(base.join("system.slice")).expect("create other");

        Cgroup::sweep_stale(&base);

        assert!(!base.join("job-old").exists());
        assert!(base.join("system.slice").exists());

        fs::remove_dir_all(&base).expect("cleanup scratch");
    }

    // Ignored: requires root and a delegated cgroup v2 hierarchy.
    #[ignore]
    #[test]
    fn test_create_applies_cpu_and_memory_limits() {
        use crate::jobs::cgroups::{CpuPercent, MemoryMb};
        use validation::ValidatedField;

        let base = Path::new("/sys/fs/cgroup/jobworkerd.slice");
        let job_id = JobId::random();
        let limits = JobLimits {
            cpu_percent: CpuPercent::validate(Some(50), "cpu", None)
                .expect("valid cpu limit"),
            memory_mb: MemoryMb::validate(Some(64), "memory", None)
                .expect("valid memory limit"),
            io_bytes_per_sec: Default::default(),
        };

        let cgroup = Cgroup::create(base, &job_id, &limits, None)
            .expect("create cgroup");

        let cpu_max = fs::read_to_string(cgroup.path().join("cpu.max"))
            .expect("read cpu.max");
        assert!(cpu_max.starts_with("50000 100000"));

        let memory_max = fs::read_to_string(cgroup.path().join("memory.max"))
            .expect("read memory.max");
        assert_eq!(memory_max.trim(), (64 * 1024 * 1024).to_string());

        cleanup_blocking(&job_dir(base, &job_id));
    }

    #[test]
    fn test_io_device_round_trip() {
        let device = IoDevice::from_str("253:7").expect("parse");
        assert_eq!(device.to_string(), "253:7");
    }
}
