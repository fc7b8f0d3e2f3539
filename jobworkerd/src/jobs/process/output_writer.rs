/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use crate::jobs::store::{JobId, JobStore};
use bytes::Bytes;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

const READ_BUFFER_SIZE: usize = 8192;
const PUMP_CHANNEL_CAPACITY: usize = 16;

/// Byte sink bridging a child's merged stdout/stderr into the store.
///
/// Writes never fail and always report the full length as consumed; the
/// store's buffer is the authoritative record, live delivery is best effort.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    store: Arc<JobStore>,
    job_id: JobId,
}

impl OutputWriter {
    pub fn new(store: Arc<JobStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    /// Appends one chunk. The caller hands over its own copy of the bytes;
    /// the source buffer may be reused immediately.
    pub async fn write(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }

        if let Err(e) =
            self.store.append(&self.job_id, Bytes::from(chunk)).await
        {
            trace!(job_id = %self.job_id, "dropping output chunk: {e}");
        }
    }
}

/// Pumps the read end of the child's output pipe into the writer until EOF.
/// The pipe read runs on a blocking thread; each chunk is copied out of the
/// read buffer before it crosses into the async side.
pub fn spawn_output_pump(
    writer: OutputWriter,
    output: OwnedFd,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PUMP_CHANNEL_CAPACITY);

    let reader = tokio::task::spawn_blocking(move || {
        let mut pipe = std::fs::File::from(output);
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue
                }
                Err(e) => {
                    trace!("output pipe closed: {e}");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            writer.write(chunk).await;
        }
        if let Err(e) = reader.await {
            warn!("output reader thread failed: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{JobLimits, JobSpec};
    use std::io::Write;

    fn store_with_running_job() -> (Arc<JobStore>, JobId) {
        let store = Arc::new(JobStore::new(0));
        let (job_id, _task) = store
            .create_pending(JobSpec {
                command: "/bin/cat".into(),
                args: vec![],
                limits: JobLimits::default(),
            })
            .expect("create job");
        store
            .mark_running(&job_id, 42, std::time::SystemTime::now())
            .expect("mark running");
        (store, job_id)
    }

    #[tokio::test]
    async fn test_writer_appends_to_store() {
        let (store, job_id) = store_with_running_job();
        let writer = OutputWriter::new(store.clone(), job_id.clone());

        writer.write(b"first ".to_vec()).await;
        writer.write(Vec::new()).await; // empty writes are dropped
        writer.write(b"second".to_vec()).await;

        let snapshot = store.snapshot(&job_id).expect("snapshot");
        assert_eq!(&snapshot.output[..], b"first second");
    }

    #[tokio::test]
    async fn test_writer_survives_unknown_job() {
        let store = Arc::new(JobStore::new(0));
        let writer = OutputWriter::new(store, JobId::random());
        // Must not error or panic; the job is simply gone.
        writer.write(b"orphaned".to_vec()).await;
    }

    #[tokio::test]
    async fn test_pump_copies_pipe_to_store_until_eof() {
        let (store, job_id) = store_with_running_job();
        let writer = OutputWriter::new(store.clone(), job_id.clone());

        let (read_fd, write_fd) = nix::unistd::pipe().expect("pipe");
        let pump = spawn_output_pump(writer, read_fd);

        {
            let mut sink = std::fs::File::from(write_fd);
            sink.write_all(b"streamed through the pipe").expect("write");
        } // dropping the write end delivers EOF

        pump.await.expect("pump join");

        let snapshot = store.snapshot(&job_id).expect("snapshot");
        assert_eq!(&snapshot.output[..], b"streamed through the pipe");
    }
}
