/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use crate::jobs::{process::Supervisor, JobService};
use jobworker_proto::jobs::job_service_server::JobServiceServer;
use std::sync::Arc;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch::{channel, Receiver, Sender};
use tonic_health::server::HealthReporter;
use tracing::info;

pub(crate) struct GracefulShutdown {
    health_reporter: HealthReporter,
    supervisor: Arc<Supervisor>,
    shutdown_broadcaster: Sender<()>,
}

impl GracefulShutdown {
    pub fn new(
        health_reporter: HealthReporter,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        let (tx, _) = channel(());
        Self { health_reporter, supervisor, shutdown_broadcaster: tx }
    }

    /// Subscribe to the shutdown broadcast channel
    pub fn subscribe(&self) -> Receiver<()> {
        self.shutdown_broadcaster.subscribe()
    }

    /// Waits for SIGTERM or SIGINT and then...
    /// * Marks the job service not-serving for health checks
    /// * Broadcasts a shutdown signal to all subscribers. See [subscribe]
    /// * Waits for all subscribers to drop (the gRPC server drains)
    /// * Stops every job that is still alive; jobs do not survive the daemon
    /// ---
    /// Returns after processing the first received signal.
    pub async fn wait(mut self) {
        tokio::select! {
            _ = wait_for_sigterm() => {},
            _ = wait_for_sigint() => {},
        }

        info!("shutdown signal received, draining");

        self.health_reporter
            .set_not_serving::<JobServiceServer<JobService>>()
            .await;

        self.shutdown_broadcaster.send_replace(());
        // wait for all subscribers to drop
        self.shutdown_broadcaster.closed().await;

        self.supervisor.shutdown_all().await;

        info!("all jobs stopped");
    }
}

pub async fn wait_for_sigterm() {
    let mut stream = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to listen for SIGTERM");

    let _ = stream.recv().await;
}

pub async fn wait_for_sigint() {
    let mut stream = tokio::signal::unix::signal(SignalKind::interrupt())
        .expect("failed to listen for SIGINT");

    let _ = stream.recv().await;
}
