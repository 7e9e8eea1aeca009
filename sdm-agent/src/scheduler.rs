use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{event, instrument, Instrument, Level};
use uuid::Uuid;

use sdm_rs::api::jobs::{JobStatusReport, JobSummary};

use crate::config::JobsConfig;
use crate::jobs::{AbortError, Job, JobContext};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("job {0} already exists")]
    JobExists(Uuid),
    #[error("no such job: {0}")]
    NoSuchJob(Uuid),
    #[error("job {0} has not finished yet")]
    JobNotFinished(Uuid),
    #[error(transparent)]
    Abort(#[from] AbortError),
}

/// Registry of submitted jobs.
///
/// Every job runs in its own task; at most `max_workers` of them execute at
/// the same time. Jobs touching the same image are serialized by the
/// resource guard, not by the scheduler.
#[derive(Debug)]
pub struct Scheduler {
    context: JobContext,
    jobs: Mutex<BTreeMap<Uuid, Arc<Job>>>,
    workers: Arc<Semaphore>,
    autodelete_after: Option<Duration>,
}

impl Scheduler {
    pub fn new(context: JobContext, config: &JobsConfig) -> Arc<Self> {
        Arc::new(Scheduler {
            context,
            jobs: Mutex::new(BTreeMap::new()),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            autodelete_after: config.autodelete_after,
        })
    }

    /// Register a job and dispatch it.
    ///
    /// Failures of the job itself are never reported here, only through
    /// [`Scheduler::status`].
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub async fn submit(self: &Arc<Self>, job: Job) -> Result<Uuid, SchedulerError> {
        let job_id = job.id();
        let job = Arc::new(job);

        match self.jobs.lock().await.entry(job_id) {
            Entry::Occupied(_) => {
                event!(Level::WARN, "Rejecting job with duplicate id");
                return Err(SchedulerError::JobExists(job_id));
            }
            Entry::Vacant(entry) => {
                entry.insert(job.clone());
            }
        }

        event!(Level::INFO, endpoint_type = job.descriptor().endpoint_type(), priority = job.priority(), "Job submitted");
        tokio::spawn(
            Arc::clone(self)
                .dispatch(job)
                .instrument(tracing::info_span!("(job worker)", %job_id)),
        );

        Ok(job_id)
    }

    async fn dispatch(self: Arc<Self>, job: Arc<Job>) {
        if !job.status().status.is_terminal() {
            let _permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_closed) => {
                    event!(Level::ERROR, "Worker semaphore closed, not running job");
                    return;
                }
            };
            job.run(&self.context).await;
        }

        if let Some(delay) = self.autodelete_after {
            let scheduler = Arc::downgrade(&self);
            drop(self);
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.forget(&job).await;
            }
        }
    }

    async fn forget(&self, job: &Arc<Job>) {
        let mut jobs = self.jobs.lock().await;
        // Only remove the entry if it still is this very job:
        if jobs.get(&job.id()).is_some_and(|j| Arc::ptr_eq(j, job)) {
            event!(Level::DEBUG, job_id = %job.id(), "Auto-deleting finished job");
            jobs.remove(&job.id());
        }
    }

    async fn job(&self, job_id: Uuid) -> Result<Arc<Job>, SchedulerError> {
        // Do not hold onto the map lock:
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(SchedulerError::NoSuchJob(job_id))
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusReport, SchedulerError> {
        Ok(self.job(job_id).await?.status())
    }

    /// Summaries of all known jobs, oldest first.
    pub async fn list(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .jobs
            .lock()
            .await
            .values()
            .map(|job| job.summary())
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.job_id.cmp(&b.job_id))
        });
        summaries
    }

    #[instrument(skip(self))]
    pub async fn abort(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        self.job(job_id).await?.abort()?;
        Ok(())
    }

    /// Remove a finished job from the registry.
    #[instrument(skip(self))]
    pub async fn delete(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get(&job_id).ok_or(SchedulerError::NoSuchJob(job_id))?;
        if !job.status().status.is_terminal() {
            return Err(SchedulerError::JobNotFinished(job_id));
        }
        jobs.remove(&job_id);
        event!(Level::DEBUG, "Deleted job");
        Ok(())
    }

    /// Wait for a job to finish and return its final status.
    pub async fn wait(&self, job_id: Uuid) -> Result<JobStatusReport, SchedulerError> {
        let job = self.job(job_id).await?;
        Ok(job.wait().await)
    }
}
