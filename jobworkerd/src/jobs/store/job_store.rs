/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::{
    Job, JobId, JobSnapshot, JobSpec, JobStatus, Result, StoreError,
    Subscriber, Task,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// UUID collisions do not happen in practice; the bound exists so a broken
/// random source cannot spin the allocator forever.
const MAX_ID_ALLOCATION_ATTEMPTS: usize = 8;

/// The single source of truth for job state and output.
///
/// The store owns one [Task] per job. All mutations go through the store (or
/// the task it hands to the supervisor); all reads are point-in-time copies.
#[derive(Debug)]
pub struct JobStore {
    tasks: RwLock<HashMap<JobId, Arc<Task>>>,
    output_buffer_capacity: usize,
}

impl JobStore {
    pub fn new(output_buffer_capacity: usize) -> Self {
        Self { tasks: RwLock::new(HashMap::new()), output_buffer_capacity }
    }

    /// Registers a new job in INITIALIZING state and returns its id together
    /// with the owning task. The spec must already be validated.
    pub fn create_pending(
        &self,
        spec: JobSpec,
    ) -> Result<(JobId, Arc<Task>)> {
        let mut tasks = self.lock_write();

        let mut job_id = JobId::random();
        let mut attempts = 1;
        while tasks.contains_key(&job_id) {
            if attempts >= MAX_ID_ALLOCATION_ATTEMPTS {
                return Err(StoreError::IdExhausted);
            }
            job_id = JobId::random();
            attempts += 1;
        }

        let task = Arc::new(Task::new(
            job_id.clone(),
            spec,
            self.output_buffer_capacity,
        ));
        let _ = tasks.insert(job_id.clone(), task.clone());

        Ok((job_id, task))
    }

    pub fn get(&self, job_id: &JobId) -> Result<Arc<Task>> {
        let tasks = self.lock_read();
        tasks.get(job_id).cloned().ok_or_else(|| StoreError::JobNotFound {
            job_id: job_id.clone(),
        })
    }

    /// INITIALIZING → RUNNING.
    pub fn mark_running(
        &self,
        job_id: &JobId,
        pid: i32,
        start_time: SystemTime,
    ) -> Result<()> {
        self.get(job_id)?.mark_running(pid, start_time)
    }

    /// RUNNING (or INITIALIZING on setup failure) → terminal state. Publishes
    /// the final update to every subscriber and closes the job to further
    /// subscription.
    pub async fn mark_terminal(
        &self,
        job_id: &JobId,
        status: JobStatus,
        exit_code: i32,
        end_time: SystemTime,
    ) -> Result<()> {
        self.get(job_id)?.mark_terminal(status, exit_code, end_time).await
    }

    /// Appends output and publishes it to live subscribers. Appending to a
    /// terminal job is a no-op.
    pub async fn append(&self, job_id: &JobId, chunk: Bytes) -> Result<()> {
        self.get(job_id)?.append(chunk).await;
        Ok(())
    }

    pub fn snapshot(&self, job_id: &JobId) -> Result<JobSnapshot> {
        Ok(self.get(job_id)?.snapshot())
    }

    /// Copies of every job, ordered by start time ascending. Jobs that have
    /// not started yet sort first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = {
            let tasks = self.lock_read();
            tasks.values().map(|task| task.job()).collect()
        };

        jobs.sort_by_key(|job| job.start_time.unwrap_or(UNIX_EPOCH));
        jobs
    }

    /// Registers a live subscriber with a RUNNING job.
    pub fn subscribe(&self, job_id: &JobId) -> Result<Subscriber> {
        self.get(job_id)?.subscribe()
    }

    /// Atomic snapshot + subscription for the streaming facade: the returned
    /// output copy ends exactly where the subscription begins.
    pub fn attach(
        &self,
        job_id: &JobId,
    ) -> Result<(JobSnapshot, Option<Subscriber>)> {
        Ok(self.get(job_id)?.attach())
    }

    /// Detaches a subscriber. Dropping the subscriber does the same; calling
    /// this twice is harmless.
    pub fn unsubscribe(&self, subscriber: Subscriber) {
        drop(subscriber);
    }

    /// Every task currently registered. Used by shutdown to stop all jobs.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.lock_read().values().cloned().collect()
    }

    fn lock_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Arc<Task>>> {
        self.tasks.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn lock_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Arc<Task>>> {
        self.tasks.write().unwrap_or_else(|poison| poison.into_inner())
    }
}
