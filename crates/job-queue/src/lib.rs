//! Serialises asynchronous side effects so at most one is in flight.
//!
//! Jobs run in submission order. A job that fails (or panics) is logged and
//! dropped; the next queued job starts right after it. Error handling beyond
//! that belongs inside the job itself.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

pub type JobResult = anyhow::Result<()>;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, JobResult> + Send>;

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
    runtime: Option<Handle>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: bool,
}

impl JobQueue {
    /// Jobs run on the runtime this is created in. Outside a runtime, jobs
    /// run on whichever runtime `enqueue` is called from.
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Runs `job` now if nothing is executing, otherwise appends it.
    ///
    /// With no runtime captured at construction and none current, the job
    /// is logged and dropped.
    pub fn enqueue<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let job: Job = Box::new(move || job().boxed());
        let (runtime, first) = {
            let mut state = self.inner.state.lock();
            if state.running {
                state.pending.push_back(job);
                debug!(
                    target: "notifo.jobs",
                    queued = state.pending.len(),
                    "job queued behind running job"
                );
                return;
            }
            let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok())
            else {
                error!(target: "notifo.jobs", "no Tokio runtime available, dropping job");
                return;
            };
            state.running = true;
            (runtime, job)
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(drain(inner, first));
    }

    /// Number of jobs waiting behind the running one.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        !self.inner.state.lock().running
    }

    /// Resolves once no job is running or queued.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn drain(inner: Arc<Inner>, mut job: Job) {
    loop {
        match AssertUnwindSafe(job()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target: "notifo.jobs", error = %err, "queued job failed");
            }
            Err(_) => {
                warn!(target: "notifo.jobs", "queued job panicked");
            }
        }

        let next = {
            let mut state = inner.state.lock();
            match state.pending.pop_front() {
                Some(next) => next,
                None => {
                    state.running = false;
                    break;
                }
            }
        };
        job = next;
    }
    inner.idle.notify_waiters();
}
