/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use super::{
    Job, JobId, JobSpec, JobStatus, OutputBuffer, Result, StoreError,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

/// Mailbox depth of one subscriber. Deliberately tiny so a stalled consumer
/// is detected within one publish budget instead of accumulating chunks.
pub const SUBSCRIBER_MAILBOX_CAPACITY: usize = 2;

/// How long a publish waits for space in a full subscriber mailbox before the
/// subscriber is evicted.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_millis(50);

/// One update delivered to live subscribers: an output chunk while the job
/// runs, or a chunkless status update on the terminal transition.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub chunk: Option<Bytes>,
}

/// A consistent point-in-time view of one job: the record, a copy of the
/// retained output, and whether the job was running at the observation point.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: Job,
    pub output: Bytes,
    pub dropped_bytes: u64,
    pub is_running: bool,
}

/// A live consumer of one job's output. Dropping the subscriber (or calling
/// `JobStore::unsubscribe`) detaches it from the task.
#[derive(Debug)]
pub struct Subscriber {
    id: u64,
    job_id: JobId,
    rx: mpsc::Receiver<JobUpdate>,
    task: Weak<Task>,
}

impl Subscriber {
    /// Receives the next update. Returns [None] once the terminal update has
    /// been consumed (the channel is closed), or after eviction.
    pub async fn recv(&mut self) -> Option<JobUpdate> {
        self.rx.recv().await
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(task) = self.task.upgrade() {
            task.remove_subscriber(self.id);
        }
    }
}

#[derive(Debug)]
struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<JobUpdate>,
}

#[derive(Debug)]
struct TaskState {
    job: Job,
    buffer: OutputBuffer,
    subscribers: Vec<SubscriberSlot>,
    next_subscriber_id: u64,
    stop_requested: bool,
}

/// The per-job hub joining the store's mutations to live subscribers.
///
/// Locking: `state` is a plain mutex held only for short, await-free critical
/// sections. `publish` is an async mutex serializing the fan-out phase so
/// every subscriber observes chunks in append order and never after the
/// terminal update.
#[derive(Debug)]
pub struct Task {
    state: Mutex<TaskState>,
    publish: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<JobStatus>,
}

impl Task {
    pub fn new(id: JobId, spec: JobSpec, buffer_capacity: usize) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Initializing);
        Self {
            state: Mutex::new(TaskState {
                job: Job::new(id, spec),
                buffer: OutputBuffer::new(buffer_capacity),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                stop_requested: false,
            }),
            publish: tokio::sync::Mutex::new(()),
            status_tx,
        }
    }

    /// Point-in-time copy of the job record.
    pub fn job(&self) -> Job {
        self.lock_state().job.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.lock_state();
        snapshot_locked(&state)
    }

    /// Records the cgroup directory assigned to this job. Terminal jobs are
    /// immutable; late calls are ignored.
    pub fn set_cgroup_path(&self, path: PathBuf) {
        let mut state = self.lock_state();
        if !state.job.status.is_terminal() {
            state.job.cgroup_path = Some(path);
        }
    }

    /// Flags the job for termination. Returns the status observed at that
    /// point and whether a stop had already been requested, so concurrent
    /// stop calls deliver at most one signal ladder. A launch in flight
    /// aborts when it sees the flag.
    pub fn request_stop(&self) -> (JobStatus, bool) {
        let mut state = self.lock_state();
        let already_requested = state.stop_requested;
        state.stop_requested = true;
        (state.job.status, already_requested)
    }

    pub fn stop_requested(&self) -> bool {
        self.lock_state().stop_requested
    }

    /// INITIALIZING → RUNNING. Fails if a stop arrived first so the launch
    /// path can abort before user code runs.
    pub fn mark_running(
        &self,
        pid: i32,
        start_time: SystemTime,
    ) -> Result<()> {
        {
            let mut state = self.lock_state();

            if state.stop_requested {
                return Err(StoreError::StopRequested {
                    job_id: state.job.id.clone(),
                });
            }

            if !state.job.status.can_transition_to(JobStatus::Running) {
                return Err(StoreError::IllegalTransition {
                    job_id: state.job.id.clone(),
                    from: state.job.status,
                    to: JobStatus::Running,
                });
            }

            state.job.status = JobStatus::Running;
            state.job.pid = pid;
            state.job.start_time = Some(start_time);
        }

        let _ = self.status_tx.send_replace(JobStatus::Running);
        Ok(())
    }

    /// Transitions the job into a terminal state, broadcasts one final
    /// status-only update to every subscriber and closes their channels.
    /// Idempotent: marking an already-terminal job is a no-op.
    pub async fn mark_terminal(
        &self,
        status: JobStatus,
        exit_code: i32,
        end_time: SystemTime,
    ) -> Result<()> {
        let _publish = self.publish.lock().await;

        let (update, targets) = {
            let mut state = self.lock_state();

            if state.job.status.is_terminal() {
                trace!(job_id = %state.job.id, "job already terminal");
                return Ok(());
            }

            if !state.job.status.can_transition_to(status) {
                return Err(StoreError::IllegalTransition {
                    job_id: state.job.id.clone(),
                    from: state.job.status,
                    to: status,
                });
            }

            state.job.status = status;
            state.job.exit_code = Some(exit_code);
            state.job.end_time = Some(end_time);
            // A job that failed during setup never recorded a start instant.
            if state.job.start_time.is_none() {
                state.job.start_time = Some(end_time);
            }

            let update = JobUpdate {
                job_id: state.job.id.clone(),
                status,
                chunk: None,
            };
            let targets = std::mem::take(&mut state.subscribers);
            (update, targets)
        };

        let _ = self.status_tx.send_replace(status);

        let stalled = deliver(update, &targets).await;
        if !stalled.is_empty() {
            warn!(
                stalled = stalled.len(),
                "subscribers missed the terminal update"
            );
        }
        // Dropping the slots closes every subscriber channel.
        drop(targets);

        Ok(())
    }

    /// Appends a chunk to the output buffer and publishes it to the current
    /// subscribers. Appending to a terminal job is a no-op. Subscribers that
    /// cannot take the chunk within [PUBLISH_TIMEOUT] are evicted.
    pub async fn append(&self, chunk: Bytes) {
        let _publish = self.publish.lock().await;

        let (update, targets) = {
            let mut state = self.lock_state();

            if state.job.status.is_terminal() {
                return;
            }

            state.buffer.push(&chunk);

            let update = JobUpdate {
                job_id: state.job.id.clone(),
                status: state.job.status,
                chunk: Some(chunk),
            };
            let targets: Vec<SubscriberSlot> = state
                .subscribers
                .iter()
                .map(|slot| SubscriberSlot { id: slot.id, tx: slot.tx.clone() })
                .collect();
            (update, targets)
        };

        let stalled = deliver(update, &targets).await;
        if !stalled.is_empty() {
            let mut state = self.lock_state();
            state.subscribers.retain(|slot| !stalled.contains(&slot.id));
            warn!(
                job_id = %state.job.id,
                evicted = stalled.len(),
                "evicted stalled subscribers"
            );
        }
    }

    /// Registers a new subscriber. Only RUNNING jobs accept subscribers; the
    /// registration is atomic with the status observation, so a subscriber
    /// admitted here is guaranteed the terminal update.
    pub fn subscribe(self: &Arc<Self>) -> Result<Subscriber> {
        let mut state = self.lock_state();

        if state.job.status != JobStatus::Running {
            return Err(StoreError::NotRunning {
                job_id: state.job.id.clone(),
                status: state.job.status,
            });
        }

        Ok(register_locked(self, &mut state))
    }

    /// Takes a snapshot and, when the job is still running, registers a
    /// subscriber under the same critical section. The returned output copy
    /// and the subscription point line up exactly: replaying the snapshot and
    /// then draining the subscriber yields every chunk once, in order.
    pub fn attach(self: &Arc<Self>) -> (JobSnapshot, Option<Subscriber>) {
        let mut state = self.lock_state();

        let snapshot = snapshot_locked(&state);
        let subscriber = snapshot
            .is_running
            .then(|| register_locked(self, &mut state));

        (snapshot, subscriber)
    }

    pub(super) fn remove_subscriber(&self, id: u64) {
        let mut state = self.lock_state();
        state.subscribers.retain(|slot| slot.id != id);
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait_terminal(&self) -> JobStatus {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                // The task is being torn down; report the last known status.
                return *rx.borrow();
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TaskState> {
        // A poisoned state mutex means a panic while holding the lock; the
        // job record is still the best information available.
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn snapshot_locked(state: &TaskState) -> JobSnapshot {
    JobSnapshot {
        job: state.job.clone(),
        output: state.buffer.contents(),
        dropped_bytes: state.buffer.dropped_bytes(),
        is_running: state.job.status == JobStatus::Running,
    }
}

fn register_locked(task: &Arc<Task>, state: &mut TaskState) -> Subscriber {
    let id = state.next_subscriber_id;
    state.next_subscriber_id += 1;

    let (tx, rx) = mpsc::channel(SUBSCRIBER_MAILBOX_CAPACITY);
    state.subscribers.push(SubscriberSlot { id, tx });

    Subscriber {
        id,
        job_id: state.job.id.clone(),
        rx,
        task: Arc::downgrade(task),
    }
}

/// Fans an update out to every target concurrently, giving each subscriber
/// its own [PUBLISH_TIMEOUT] budget. Returns the ids that missed it.
async fn deliver(update: JobUpdate, targets: &[SubscriberSlot]) -> Vec<u64> {
    if targets.is_empty() {
        return Vec::new();
    }

    let mut deliveries = tokio::task::JoinSet::new();
    for slot in targets {
        let tx = slot.tx.clone();
        let id = slot.id;
        let update = update.clone();
        let _ = deliveries.spawn(async move {
            let delivered = match tx.try_send(update) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(update)) => matches!(
                    tokio::time::timeout(PUBLISH_TIMEOUT, tx.send(update))
                        .await,
                    Ok(Ok(()))
                ),
            };
            (id, delivered)
        });
    }

    let mut stalled = Vec::new();
    while let Some(joined) = deliveries.join_next().await {
        match joined {
            Ok((_, true)) => {}
            Ok((id, false)) => stalled.push(id),
            Err(e) => warn!("subscriber delivery task failed: {e}"),
        }
    }
    stalled
}
