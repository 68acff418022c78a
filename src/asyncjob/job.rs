//! A named, retryable unit of async work.

use crate::error::{BoxError, JobError};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wait before each retry, in order.
pub const DEFAULT_RETRY_DURATIONS: [Duration; 4] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(180),
];

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type Handler = Arc<dyn Fn(CancellationToken) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Init,
    Doing,
    Retrying,
    Failed,
    Completed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Init => "init",
            JobState::Doing => "doing",
            JobState::Retrying => "retrying",
            JobState::Failed => "failed",
            JobState::Completed => "completed",
        };
        f.write_str(s)
    }
}

struct Progress {
    state: JobState,
    history: Vec<JobState>,
    retry_durations: Vec<Duration>,
    next_retry: usize,
}

impl Progress {
    fn set(&mut self, state: JobState) {
        self.state = state;
        self.history.push(state);
    }
}

struct JobInner {
    name: String,
    handler: Handler,
    progress: Mutex<Progress>,
    cancel: CancellationToken,
}

/// A retryable job. Clones share state, so a clone can cancel a running job.
///
/// ```text
/// Init -> Doing -> (Retrying)* -> Completed | Failed
/// ```
///
/// # Example
///
/// ```ignore
/// let job = Job::new("sync-users", |cancel| async move {
///     tokio::select! {
///         r = sync_users() => r,
///         _ = cancel.cancelled() => Ok(()),
///     }
/// })
/// .with_retry_durations(vec![Duration::from_secs(1), Duration::from_secs(5)]);
///
/// job.run_with_retries().await?;
/// ```
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |token| Box::pin(handler(token)));
        Self {
            inner: Arc::new(JobInner {
                name: name.into(),
                handler,
                progress: Mutex::new(Progress {
                    state: JobState::Init,
                    history: vec![JobState::Init],
                    retry_durations: DEFAULT_RETRY_DURATIONS.to_vec(),
                    next_retry: 0,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Replaces the retry schedule.
    pub fn with_retry_durations(self, durations: Vec<Duration>) -> Self {
        self.set_retry_durations(durations);
        self
    }

    pub fn set_retry_durations(&self, durations: Vec<Duration>) {
        self.progress().retry_durations = durations;
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> JobState {
        self.progress().state
    }

    /// Every state the job went through, oldest first.
    pub fn history(&self) -> Vec<JobState> {
        self.progress().history.clone()
    }

    /// Runs the handler once.
    pub async fn execute(&self) -> Result<(), JobError> {
        if self.inner.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        {
            let mut progress = self.progress();
            if progress.state != JobState::Retrying {
                debug!(job = %self.inner.name, "doing job");
                progress.set(JobState::Doing);
            }
        }

        let token = self.inner.cancel.child_token();
        let attempt = (self.inner.handler)(token);
        let outcome = tokio::select! {
            outcome = attempt => outcome,
            _ = self.inner.cancel.cancelled() => return Err(self.cancelled()),
        };

        outcome.map_err(|source| JobError::Handler {
            name: self.inner.name.clone(),
            source,
        })?;
        debug!(job = %self.inner.name, "completed job");
        self.progress().set(JobState::Completed);
        Ok(())
    }

    /// Waits for the next scheduled delay and executes again. Once the
    /// schedule is used up the job is failed with [`JobError::TaskFailed`].
    pub async fn retry(&self) -> Result<(), JobError> {
        let delay = {
            let mut progress = self.progress();
            match progress.retry_durations.get(progress.next_retry).copied() {
                Some(delay) => {
                    progress.next_retry += 1;
                    progress.set(JobState::Retrying);
                    delay
                }
                None => {
                    progress.set(JobState::Failed);
                    debug!(job = %self.inner.name, "failed job");
                    return Err(JobError::TaskFailed {
                        name: self.inner.name.clone(),
                    });
                }
            }
        };

        debug!(job = %self.inner.name, delay = ?delay, "prepare to retry job");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.inner.cancel.cancelled() => return Err(self.cancelled()),
        }
        debug!(job = %self.inner.name, "retrying job");
        self.execute().await
    }

    /// Executes, then retries until success or the schedule runs out.
    ///
    /// Handler errors are logged and retried; the terminal error is
    /// [`JobError::TaskFailed`] or [`JobError::Cancelled`].
    pub async fn run_with_retries(&self) -> Result<(), JobError> {
        let mut outcome = self.execute().await;
        loop {
            match outcome {
                Ok(()) => return Ok(()),
                Err(JobError::Handler { name, source }) => {
                    debug!(job = %name, error = %source, "job attempt failed");
                    outcome = self.retry().await;
                }
                Err(terminal) => return Err(terminal),
            }
        }
    }

    /// Cancels the running attempt and any later one.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn cancelled(&self) -> JobError {
        let mut progress = self.progress();
        if progress.state != JobState::Failed {
            progress.set(JobState::Failed);
        }
        JobError::Cancelled(self.inner.name.clone())
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing(name: &str, calls: Arc<AtomicUsize>) -> Job {
        Job::new(name, move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>("boom".into())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_fails_after_schedule() {
        let calls = Arc::new(AtomicUsize::new(0));
        let job = failing("flaky", calls.clone())
            .with_retry_durations(vec![Duration::from_secs(2), Duration::from_secs(3)]);

        let started = tokio::time::Instant::now();
        let err = job.run_with_retries().await.unwrap_err();

        assert!(matches!(err, JobError::TaskFailed { ref name } if name == "flaky"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            job.history(),
            vec![
                JobState::Init,
                JobState::Doing,
                JobState::Retrying,
                JobState::Retrying,
                JobState::Failed
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let job = Job::new("second-time", move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err::<(), BoxError>("not yet".into());
                }
                Ok(())
            }
        });

        job.run_with_retries().await.unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn execute_surfaces_handler_error() {
        let job = failing("once", Arc::new(AtomicUsize::new(0)));
        let err = job.execute().await.unwrap_err();
        assert!(matches!(err, JobError::Handler { ref name, .. } if name == "once"));
        assert_eq!(job.state(), JobState::Doing);
    }

    #[tokio::test]
    async fn empty_schedule_fails_immediately() {
        let job = failing("no-retry", Arc::new(AtomicUsize::new(0))).with_retry_durations(vec![]);
        assert!(matches!(job.retry().await, Err(JobError::TaskFailed { .. })));
        assert_eq!(job.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn cancel_interrupts_running_attempt() {
        let job = Job::new("forever", |_| async {
            std::future::pending::<()>().await;
            Ok::<(), BoxError>(())
        });
        let running = {
            let job = job.clone();
            tokio::spawn(async move { job.execute().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        job.cancel();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, JobError::Cancelled(_)));
        assert_eq!(job.state(), JobState::Failed);
    }
}
