/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::auth;
use super::error::JobServiceError;
use super::process::Supervisor;
use super::store::{Job, JobStatus, JobStore, Subscriber};
use super::validation::{
    ValidatedCreateJobRequest, ValidatedGetJobRequest, ValidatedStopJobRequest,
    ValidatedStreamJobOutputRequest,
};
use super::JobDefaults;
use jobworker_proto::jobs as rpc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::info;
use validation::ValidatedType;

/// Historical output is replayed in chunks no larger than this; the wire cap
/// for sends is far above it.
pub const MAX_STREAM_CHUNK_SIZE: usize = 256 * 1024;

const STREAM_CHANNEL_CAPACITY: usize = 4;

/// The gRPC facade over the store and the supervisor. Performs per-operation
/// role enforcement and request validation, nothing else; all job semantics
/// live below.
#[derive(Debug, Clone)]
pub struct JobService {
    supervisor: Arc<Supervisor>,
    store: Arc<JobStore>,
    defaults: JobDefaults,
}

impl JobService {
    pub fn new(supervisor: Arc<Supervisor>, defaults: JobDefaults) -> Self {
        let store = supervisor.store().clone();
        Self { supervisor, store, defaults }
    }

    #[tracing::instrument(skip(self, request))]
    async fn create(
        &self,
        request: ValidatedCreateJobRequest,
    ) -> Result<rpc::CreateJobResponse, JobServiceError> {
        let spec = request.into_spec(&self.defaults);
        info!(command = %spec.command, "JobService: create_job");

        let job = self.supervisor.launch(spec).await?;

        Ok(rpc::CreateJobResponse { job: Some(job_to_proto(job)) })
    }

    #[tracing::instrument(skip(self))]
    async fn get(
        &self,
        request: ValidatedGetJobRequest,
    ) -> Result<rpc::GetJobResponse, JobServiceError> {
        let snapshot = self.store.snapshot(&request.job_id)?;

        Ok(rpc::GetJobResponse { job: Some(job_to_proto(snapshot.job)) })
    }

    #[tracing::instrument(skip(self))]
    async fn stop(
        &self,
        request: ValidatedStopJobRequest,
    ) -> Result<rpc::StopJobResponse, JobServiceError> {
        info!(job_id = %request.job_id, "JobService: stop_job");

        let job = self.supervisor.stop(&request.job_id).await?;

        Ok(rpc::StopJobResponse {
            id: job.id.to_string(),
            status: proto_status(job.status) as i32,
            exit_code: job.exit_code.unwrap_or_default(),
            end_time_ms: epoch_ms(job.end_time),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self) -> Result<rpc::ListJobsResponse, JobServiceError> {
        let jobs = self.store.list().into_iter().map(job_to_proto).collect();

        Ok(rpc::ListJobsResponse { jobs })
    }
}

#[tonic::async_trait]
impl rpc::job_service_server::JobService for JobService {
    async fn create_job(
        &self,
        request: Request<rpc::CreateJobRequest>,
    ) -> Result<Response<rpc::CreateJobResponse>, Status> {
        let _role = auth::authorize(&request, true)
            .map_err(JobServiceError::Auth)?;
        let request =
            ValidatedCreateJobRequest::validate(request.into_inner(), None)?;

        Ok(Response::new(self.create(request).await?))
    }

    async fn get_job(
        &self,
        request: Request<rpc::GetJobRequest>,
    ) -> Result<Response<rpc::GetJobResponse>, Status> {
        let _role = auth::authorize(&request, false)
            .map_err(JobServiceError::Auth)?;
        let request =
            ValidatedGetJobRequest::validate(request.into_inner(), None)?;

        Ok(Response::new(self.get(request).await?))
    }

    async fn stop_job(
        &self,
        request: Request<rpc::StopJobRequest>,
    ) -> Result<Response<rpc::StopJobResponse>, Status> {
        let _role = auth::authorize(&request, true)
            .map_err(JobServiceError::Auth)?;
        let request =
            ValidatedStopJobRequest::validate(request.into_inner(), None)?;

        Ok(Response::new(self.stop(request).await?))
    }

    async fn list_jobs(
        &self,
        request: Request<rpc::ListJobsRequest>,
    ) -> Result<Response<rpc::ListJobsResponse>, Status> {
        let _role = auth::authorize(&request, false)
            .map_err(JobServiceError::Auth)?;

        Ok(Response::new(self.list().await?))
    }

    type StreamJobOutputStream =
        ReceiverStream<Result<rpc::StreamJobOutputResponse, Status>>;

    /// Streaming protocol: replay the retained history from an atomic
    /// snapshot, then (if the job is still running) forward live chunks until
    /// the terminal update. The snapshot and the subscription are taken in
    /// one critical section, so nothing is duplicated or lost in between.
    async fn stream_job_output(
        &self,
        request: Request<rpc::StreamJobOutputRequest>,
    ) -> Result<Response<Self::StreamJobOutputStream>, Status> {
        let _role = auth::authorize(&request, false)
            .map_err(JobServiceError::Auth)?;
        let request = ValidatedStreamJobOutputRequest::validate(
            request.into_inner(),
            None,
        )?;

        let (snapshot, subscriber) = self
            .store
            .attach(&request.job_id)
            .map_err(JobServiceError::Store)?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let _forwarder = tokio::spawn(forward_output(tx, snapshot.output, subscriber));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Runs for the lifetime of one output stream. A client that goes away mid
/// stream makes the send fail, which drops the subscriber and detaches it
/// from the job; the job itself is never affected.
async fn forward_output(
    tx: mpsc::Sender<Result<rpc::StreamJobOutputResponse, Status>>,
    history: bytes::Bytes,
    subscriber: Option<Subscriber>,
) {
    for chunk in history.chunks(MAX_STREAM_CHUNK_SIZE) {
        let resp = rpc::StreamJobOutputResponse { payload: chunk.to_vec() };
        if tx.send(Ok(resp)).await.is_err() {
            return;
        }
    }

    // Not running: the history is the complete output, close the stream.
    let Some(mut subscriber) = subscriber else {
        return;
    };

    while let Some(update) = subscriber.recv().await {
        if let Some(chunk) = update.chunk {
            if !chunk.is_empty() {
                let resp =
                    rpc::StreamJobOutputResponse { payload: chunk.to_vec() };
                if tx.send(Ok(resp)).await.is_err() {
                    return;
                }
            }
        }

        if update.status.is_terminal() {
            return;
        }
    }
}

fn job_to_proto(job: Job) -> rpc::Job {
    rpc::Job {
        id: job.id.to_string(),
        command: job.command,
        args: job.args,
        limits: Some(rpc::JobLimits {
            max_cpu_percent: job.limits.cpu_percent.into_inner(),
            max_memory_mb: job.limits.memory_mb.into_inner(),
            max_io_bytes_per_sec: job.limits.io_bytes_per_sec.into_inner(),
        }),
        status: proto_status(job.status) as i32,
        pid: job.pid,
        exit_code: job.exit_code.unwrap_or_default(),
        start_time_ms: epoch_ms(job.start_time),
        end_time_ms: epoch_ms(job.end_time),
    }
}

fn proto_status(status: JobStatus) -> rpc::JobStatus {
    match status {
        JobStatus::Initializing => rpc::JobStatus::Initializing,
        JobStatus::Running => rpc::JobStatus::Running,
        JobStatus::Completed => rpc::JobStatus::Completed,
        JobStatus::Failed => rpc::JobStatus::Failed,
        JobStatus::Stopped => rpc::JobStatus::Stopped,
    }
}

fn epoch_ms(instant: Option<SystemTime>) -> u64 {
    instant
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{JobId, JobLimits, JobSpec};
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            proto_status(JobStatus::Initializing),
            rpc::JobStatus::Initializing
        );
        assert_eq!(proto_status(JobStatus::Running), rpc::JobStatus::Running);
        assert_eq!(
            proto_status(JobStatus::Completed),
            rpc::JobStatus::Completed
        );
        assert_eq!(proto_status(JobStatus::Failed), rpc::JobStatus::Failed);
        assert_eq!(proto_status(JobStatus::Stopped), rpc::JobStatus::Stopped);
    }

    #[test]
    fn test_epoch_ms() {
        assert_eq!(epoch_ms(None), 0);
        let t = UNIX_EPOCH + Duration::from_millis(1_234);
        assert_eq!(epoch_ms(Some(t)), 1_234);
    }

    #[test]
    fn test_job_to_proto_round_trips_fields() {
        let job = Job::new(
            JobId::from("job-1"),
            JobSpec {
                command: "/bin/echo".into(),
                args: vec!["a".into(), "b".into()],
                limits: JobLimits::default(),
            },
        );

        let proto = job_to_proto(job);
        assert_eq!(proto.id, "job-1");
        assert_eq!(proto.command, "/bin/echo");
        assert_eq!(proto.args, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(proto.status, rpc::JobStatus::Initializing as i32);
        assert_eq!(proto.pid, 0);
        assert_eq!(proto.exit_code, 0);
        assert_eq!(proto.start_time_ms, 0);
    }
}
