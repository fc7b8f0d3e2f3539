/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(clippy::unwrap_used)]

use clap::Parser;
use jobworkerd::jobs::cgroups::IoDevice;
use jobworkerd::jobs::JobDefaults;
use jobworkerd::{run, JobWorkerRuntime};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

/// Default exit code for successful termination of jobworkerd.
pub const EXIT_OKAY: i32 = 0;

/// Default exit code for a runtime error of jobworkerd.
pub const EXIT_ERROR: i32 = 1;

/// Command line options for jobworkerd.
///
/// Defines the configurable options which can be used to populate
/// a JobWorkerRuntime structure.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct JobWorkerdOptions {
    /// The signed server certificate. Defaults to /etc/jobworkerd/pki/_signed.server.crt
    #[clap(long, value_parser)]
    server_crt: Option<String>,
    /// The secret server key. Defaults to /etc/jobworkerd/pki/server.key
    #[clap(long, value_parser)]
    server_key: Option<String>,
    /// The CA certificate client certificates must chain to.
    /// Defaults to /etc/jobworkerd/pki/ca.crt
    #[clap(long, value_parser)]
    ca_crt: Option<String>,
    /// TCP listen address. Defaults to [::1]:8443
    #[clap(short, long, value_parser)]
    socket: Option<String>,
    /// Cgroup v2 slice holding the per-job directories.
    /// Defaults to /sys/fs/cgroup/jobworkerd.slice
    ///
    /// The slice must have the cpu and memory controllers delegated, and
    /// ideally io.
    #[clap(long, value_parser)]
    cgroup_base: Option<String>,
    /// Block device in major:minor form for io.max entries.
    ///
    /// IO limiting only works against a real device; without this option
    /// jobs that request an IO limit run unthrottled (with a warning).
    #[clap(long, value_parser)]
    io_device: Option<String>,
    /// Milliseconds between SIGTERM and SIGKILL when stopping a job.
    /// The default of 100ms suits tests; raise it in production.
    #[clap(long, value_parser)]
    stop_grace_period_ms: Option<u64>,
    /// Retained output per job, in bytes. 0 disables the cap.
    #[clap(long, value_parser)]
    output_buffer_bytes: Option<usize>,
    /// CPU percent substituted when a request asks for 0.
    #[clap(long, value_parser, default_value_t = 10)]
    default_cpu_percent: i32,
    /// Memory limit in MiB substituted when a request asks for 0.
    #[clap(long, value_parser, default_value_t = 1)]
    default_memory_mb: i32,
    /// IO bytes/sec substituted when a request asks for 0. 0 keeps IO
    /// unlimited.
    #[clap(long, value_parser, default_value_t = 0)]
    default_io_bps: i32,
    /// Toggle verbosity. Default false
    #[clap(short, long)]
    verbose: bool,
}

fn main() {
    // Init mode is the second stage of the two-stage job launch: it runs
    // inside the job's fresh namespaces and must stay a plain process, so it
    // is dispatched before any runtime machinery spins up.
    if jobworkerd::init::in_init_mode() {
        jobworkerd::init::run();
    }

    std::process::exit(daemon_main());
}

#[tokio::main]
async fn daemon_main() -> i32 {
    let options = JobWorkerdOptions::parse();

    let JobWorkerdOptions {
        server_crt,
        server_key,
        ca_crt,
        socket,
        cgroup_base,
        io_device,
        stop_grace_period_ms,
        output_buffer_bytes,
        default_cpu_percent,
        default_memory_mb,
        default_io_bps,
        verbose,
    } = options;

    let defaults = match JobDefaults::new(
        default_cpu_percent,
        default_memory_mb,
        default_io_bps,
    ) {
        Ok(defaults) => defaults,
        Err(e) => {
            eprintln!("invalid default limits: {e}");
            return EXIT_ERROR;
        }
    };

    let io_device = match io_device.map(|s| s.parse::<IoDevice>()).transpose()
    {
        Ok(device) => device,
        Err(e) => {
            eprintln!("invalid --io-device: {e}");
            return EXIT_ERROR;
        }
    };

    let JobWorkerRuntime {
        ca_crt: default_ca_crt,
        server_crt: default_server_crt,
        server_key: default_server_key,
        cgroup_base: default_cgroup_base,
        io_device: _,
        graceful_stop_timeout: default_graceful_stop_timeout,
        output_buffer_capacity: default_output_buffer_capacity,
        defaults: _,
    } = JobWorkerRuntime::default();

    let runtime = JobWorkerRuntime {
        ca_crt: ca_crt.map(PathBuf::from).unwrap_or(default_ca_crt),
        server_crt: server_crt
            .map(PathBuf::from)
            .unwrap_or(default_server_crt),
        server_key: server_key
            .map(PathBuf::from)
            .unwrap_or(default_server_key),
        cgroup_base: cgroup_base
            .map(PathBuf::from)
            .unwrap_or(default_cgroup_base),
        io_device,
        graceful_stop_timeout: stop_grace_period_ms
            .map(Duration::from_millis)
            .unwrap_or(default_graceful_stop_timeout),
        output_buffer_capacity: output_buffer_bytes
            .unwrap_or(default_output_buffer_capacity),
        defaults,
    };

    if let Err(e) = run(runtime, socket, verbose).await {
        error!("{e:?}");
        EXIT_ERROR
    } else {
        EXIT_OKAY
    }
}
