/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Single-node remote job execution daemon.
//!
//! jobworkerd accepts commands from mTLS-authenticated clients, runs them as
//! isolated Linux processes under namespace and cgroup v2 confinement, and
//! streams their merged output to any number of live subscribers while
//! retaining it for later readers.
//!
//! Nothing is persisted: a daemon restart loses all jobs, and the startup
//! path reaps whatever a previous run left behind.

// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(clippy::unwrap_used)]

use crate::jobs::cgroups::{Cgroup, IoDevice, DEFAULT_CGROUP_BASE};
use crate::jobs::process::{
    Supervisor, SupervisorConfig, DEFAULT_GRACEFUL_STOP_TIMEOUT,
};
use crate::jobs::store::JobStore;
use crate::jobs::{JobDefaults, JobService};
use anyhow::Context;
use jobworker_proto::jobs::job_service_server::JobServiceServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info, trace};

pub mod init;
pub mod jobs;

mod graceful_shutdown;
mod logging;

/// Requests above this size are rejected; a command line is small.
pub const MAX_RECV_MESSAGE_SIZE: usize = 512 * 1024;

/// Upper bound for one response message, comfortably above the stream chunk
/// size.
pub const MAX_SEND_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Retained output per job before the oldest bytes are dropped.
pub const DEFAULT_OUTPUT_BUFFER_CAPACITY: usize = 64 * 1024 * 1024;

/// Default TCP listen address.
pub const DEFAULT_SOCKET: &str = "[::1]:8443";

/// Each instance of jobworkerd holds its state in memory. Below are the
/// settings configurable for a daemon instance.
///
/// Note: the certificate fields are file paths, not the material itself; the
/// PEMs are read at startup.
#[derive(Debug)]
pub struct JobWorkerRuntime {
    /// Certificate authority every client certificate must chain to.
    pub ca_crt: PathBuf,
    /// The signed server X509 certificate for this instance.
    pub server_crt: PathBuf,
    /// The secret key for this instance.
    pub server_key: PathBuf,
    /// Cgroup v2 slice holding the per-job directories.
    pub cgroup_base: PathBuf,
    /// Block device for io.max entries; IO limiting is skipped without one.
    pub io_device: Option<IoDevice>,
    /// SIGTERM grace window before SIGKILL on stop.
    pub graceful_stop_timeout: Duration,
    /// Retained output per job in bytes; 0 disables the cap.
    pub output_buffer_capacity: usize,
    /// Limits substituted when a request leaves them at zero.
    pub defaults: JobDefaults,
}

impl Default for JobWorkerRuntime {
    fn default() -> Self {
        Self {
            ca_crt: PathBuf::from("/etc/jobworkerd/pki/ca.crt"),
            server_crt: PathBuf::from(
                "/etc/jobworkerd/pki/_signed.server.crt",
            ),
            server_key: PathBuf::from("/etc/jobworkerd/pki/server.key"),
            cgroup_base: PathBuf::from(DEFAULT_CGROUP_BASE),
            io_device: None,
            graceful_stop_timeout: DEFAULT_GRACEFUL_STOP_TIMEOUT,
            output_buffer_capacity: DEFAULT_OUTPUT_BUFFER_CAPACITY,
            defaults: JobDefaults::new(10, 1, 0)
                .expect("builtin default limits are valid"),
        }
    }
}

/// Starts the daemon loop: TLS termination, the job service, health checks,
/// and graceful shutdown. Returns when the server has drained after a
/// SIGTERM/SIGINT, or on a fatal startup error.
pub async fn run(
    runtime: JobWorkerRuntime,
    socket: Option<String>,
    verbose: bool,
) -> anyhow::Result<()> {
    logging::init(verbose);

    info!("Starting jobworkerd");
    info!("jobworkerd is pid {}", std::process::id());
    trace!("{runtime:#?}");

    let init_binary = std::env::current_exe()
        .context("failed to locate this binary for the init stage")?;
    jobs::process::validate_init_binary(&init_binary)
        .context("init stage binary is not usable")?;

    // Jobs do not survive restarts; anything under the base is garbage.
    Cgroup::sweep_stale(&runtime.cgroup_base);

    let server_crt =
        tokio::fs::read(&runtime.server_crt).await.with_context(|| {
            format!(
                "jobworkerd requires a signed TLS certificate to run as a server, \
                 but failed to load: '{}'",
                runtime.server_crt.display()
            )
        })?;
    let server_key =
        tokio::fs::read(&runtime.server_key).await.with_context(|| {
            format!(
                "failed to load server key: '{}'",
                runtime.server_key.display()
            )
        })?;
    let server_identity = Identity::from_pem(server_crt, server_key);
    info!("Registered server TLS identity");

    let ca_crt = tokio::fs::read(&runtime.ca_crt).await.with_context(|| {
        format!("failed to load CA certificate: '{}'", runtime.ca_crt.display())
    })?;

    // Mutual TLS: every client must present a certificate signed by our CA.
    // The subject OU of that certificate selects the caller's role.
    let tls = ServerTlsConfig::new()
        .identity(server_identity)
        .client_ca_root(Certificate::from_pem(ca_crt));

    let addr: SocketAddr = socket
        .unwrap_or_else(|| DEFAULT_SOCKET.to_string())
        .parse()
        .context("invalid socket address")?;

    let store = Arc::new(JobStore::new(runtime.output_buffer_capacity));
    let supervisor = Arc::new(Supervisor::new(
        store,
        SupervisorConfig {
            cgroup_base: runtime.cgroup_base.clone(),
            io_device: runtime.io_device.clone(),
            graceful_stop_timeout: runtime.graceful_stop_timeout,
            init_binary,
        },
    ));

    // Build gRPC services
    let (mut health_reporter, health_service) =
        tonic_health::server::health_reporter();

    let job_service = JobService::new(supervisor.clone(), runtime.defaults);
    let job_service_server = JobServiceServer::new(job_service)
        .max_decoding_message_size(MAX_RECV_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_SEND_MESSAGE_SIZE);
    health_reporter.set_serving::<JobServiceServer<JobService>>().await;

    let graceful_shutdown = graceful_shutdown::GracefulShutdown::new(
        health_reporter,
        supervisor,
    );
    let graceful_shutdown_signal = graceful_shutdown.subscribe();

    // Run the server concurrently
    let server_handle = tokio::spawn(async move {
        Server::builder()
            .tls_config(tls)?
            .add_service(health_service)
            .add_service(job_service_server)
            .serve_with_shutdown(addr, async {
                let mut graceful_shutdown_signal = graceful_shutdown_signal;
                let _ = graceful_shutdown_signal.changed().await;
                info!("gRPC server received shutdown signal...");
            })
            .await?;

        info!("gRPC server exited successfully");

        Ok::<_, tonic::transport::Error>(())
    });

    // Event loop
    let graceful_shutdown_handle =
        tokio::spawn(async { graceful_shutdown.wait().await });

    let (server_result, _) =
        tokio::try_join!(server_handle, graceful_shutdown_handle)?;

    if let Err(e) = server_result {
        error!("gRPC server exited with error: {e}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runtime() {
        let runtime = JobWorkerRuntime::default();
        assert_eq!(
            runtime.cgroup_base,
            PathBuf::from("/sys/fs/cgroup/jobworkerd.slice")
        );
        assert!(runtime.io_device.is_none());
        assert_eq!(runtime.defaults.cpu_percent.into_inner(), 10);
        assert_eq!(runtime.defaults.memory_mb.into_inner(), 1);
        assert_eq!(runtime.defaults.io_bytes_per_sec.into_inner(), 0);
    }

    #[test]
    fn test_wire_size_caps() {
        assert_eq!(MAX_RECV_MESSAGE_SIZE, 512 * 1024);
        assert_eq!(MAX_SEND_MESSAGE_SIZE, 4 * 1024 * 1024);
        assert!(jobs::MAX_STREAM_CHUNK_SIZE < MAX_SEND_MESSAGE_SIZE);
    }
}
