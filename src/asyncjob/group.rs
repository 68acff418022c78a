//! Runs several jobs together, in parallel or one after another.

use super::job::Job;
use crate::error::JobError;
use std::any::Any;
use tokio::task::JoinError;
use tracing::error;

/// How a [`Group`] schedules its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every job runs on its own task; all of them finish before `run` returns.
    Parallel,
    /// Jobs run in order; the first failure skips the rest.
    Sequential,
}

/// A composition of jobs. Each job is executed and retried until its
/// schedule is exhausted before it counts as failed.
#[derive(Debug, Clone)]
pub struct Group {
    mode: Mode,
    jobs: Vec<Job>,
}

impl Group {
    pub fn new(mode: Mode, jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            mode,
            jobs: jobs.into_iter().collect(),
        }
    }

    pub fn parallel(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self::new(Mode::Parallel, jobs)
    }

    pub fn sequential(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self::new(Mode::Sequential, jobs)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Runs every job. In parallel mode a panicking job becomes
    /// [`JobError::Panicked`]; all failures are logged and the first one,
    /// in job order, is returned.
    pub async fn run(&self) -> Result<(), JobError> {
        match self.mode {
            Mode::Parallel => self.run_parallel().await,
            Mode::Sequential => self.run_sequential().await,
        }
    }

    /// Cancels every job of the group.
    pub fn cancel(&self) {
        for job in &self.jobs {
            job.cancel();
        }
    }

    async fn run_parallel(&self) -> Result<(), JobError> {
        let handles: Vec<_> = self
            .jobs
            .iter()
            .map(|job| {
                let job = job.clone();
                tokio::spawn(async move { job.run_with_retries().await })
            })
            .collect();

        let mut first_error = None;
        for (job, handle) in self.jobs.iter().zip(handles) {
            let outcome = handle
                .await
                .unwrap_or_else(|e| Err(join_failure(job.name(), e)));
            if let Err(e) = outcome {
                error!(job = %job.name(), error = %e, "job failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn run_sequential(&self) -> Result<(), JobError> {
        for job in &self.jobs {
            let runner = job.clone();
            let outcome = tokio::spawn(async move { runner.run_with_retries().await })
                .await
                .unwrap_or_else(|e| Err(join_failure(job.name(), e)));
            if let Err(e) = outcome {
                error!(job = %job.name(), error = %e, "job failed, skipping the rest");
                return Err(e);
            }
        }
        Ok(())
    }
}

fn join_failure(name: &str, err: JoinError) -> JobError {
    if err.is_cancelled() {
        return JobError::Cancelled(name.to_string());
    }
    JobError::Panicked {
        name: name.to_string(),
        message: panic_message(err.into_panic()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(_) => "unknown panic".to_string(),
    }
}
