//! Storage jobs: units of asynchronous work that mutate volumes.
//!
//! A job moves through `PENDING -> RUNNING -> {DONE, FAILED}`, or to
//! `ABORTED` when cancelled before it starts mutating anything. Once
//! terminal, its status never changes again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use sdm_rs::api::jobs::{
    JobDescriptor, JobError, JobErrorKind, JobStatus, JobStatusReport, JobSummary,
};
use sdm_rs::image::{ImageFormat, ImageTool, ImageToolError};
use sdm_rs::resource::ResourceGuard;
use sdm_rs::storage::{DomainResolver, Volume};
use sdm_rs::volume::{Legality, MetaKey, VolumeFormat};

pub mod amend_volume;
pub mod copy_data;

/// Collaborators shared by all jobs of a scheduler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub resolver: Arc<dyn DomainResolver>,
    pub guard: Arc<dyn ResourceGuard>,
    pub image_tool: Arc<dyn ImageTool>,
    /// Upper bound on waiting for the job's locks.
    pub lock_timeout: Duration,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AbortError {
    #[error("job {0} has already finished")]
    AlreadyFinished(Uuid),
}

#[derive(Debug, Clone)]
struct JobRecord {
    report: JobStatusReport,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Job {
    id: Uuid,
    priority: i32,
    descriptor: JobDescriptor,
    created_at: DateTime<Utc>,
    record: watch::Sender<JobRecord>,
    abort_requested: AtomicBool,
}

impl Job {
    pub fn new(id: Uuid, priority: i32, descriptor: JobDescriptor) -> Self {
        let (record, _) = watch::channel(JobRecord {
            report: JobStatusReport::pending(),
            finished_at: None,
        });

        Job {
            id,
            priority,
            descriptor,
            created_at: Utc::now(),
            record,
            abort_requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> JobStatusReport {
        self.record.borrow().report.clone()
    }

    pub fn summary(&self) -> JobSummary {
        let record = self.record.borrow();
        JobSummary {
            job_id: self.id,
            priority: self.priority,
            endpoint_type: self.descriptor.endpoint_type().to_string(),
            status: record.report.status,
            error: record.report.error.clone(),
            created_at: self.created_at,
            finished_at: record.finished_at,
        }
    }

    /// Resolve once the job reached a terminal status.
    pub async fn wait(&self) -> JobStatusReport {
        let mut rx = self.record.subscribe();
        // We own the sender, so the channel cannot close under us:
        let _ = rx
            .wait_for(|record| record.report.status.is_terminal())
            .await;
        self.status()
    }

    /// Request cancellation of the job.
    ///
    /// A pending job is aborted immediately. A running job is aborted at its
    /// next checkpoint, which only exist before the job starts to mutate a
    /// volume; past that point the request has no effect.
    pub fn abort(&self) -> Result<(), AbortError> {
        self.abort_requested.store(true, Ordering::SeqCst);

        let mut result = Ok(());
        self.record.send_if_modified(|record| match record.report.status {
            JobStatus::Pending => {
                record.report = JobStatusReport {
                    status: JobStatus::Aborted,
                    error: Some(aborted_error()),
                };
                record.finished_at = Some(Utc::now());
                true
            }
            JobStatus::Running => false,
            JobStatus::Done | JobStatus::Failed | JobStatus::Aborted => {
                result = Err(AbortError::AlreadyFinished(self.id));
                false
            }
        });

        if result.is_ok() {
            event!(Level::INFO, job_id = %self.id, "Abort requested");
        }
        result
    }

    pub(crate) fn check_aborted(&self) -> Result<(), JobError> {
        if self.abort_requested.load(Ordering::SeqCst) {
            Err(aborted_error())
        } else {
            Ok(())
        }
    }

    /// Execute the job. Has no effect unless the job is pending.
    ///
    /// Errors are never returned to the caller; they end up in the job's
    /// status.
    #[instrument(skip(self, context), fields(job_id = %self.id, endpoint_type = self.descriptor.endpoint_type()))]
    pub async fn run(&self, context: &JobContext) {
        let started = self.record.send_if_modified(|record| {
            if record.report.status == JobStatus::Pending {
                record.report.status = JobStatus::Running;
                true
            } else {
                false
            }
        });
        if !started {
            event!(Level::DEBUG, status = ?self.status().status, "Job is not pending, not running it");
            return;
        }

        event!(Level::INFO, descriptor = ?self.descriptor, "Running job");
        let result = match &self.descriptor {
            JobDescriptor::AmendVolume(descriptor) => {
                amend_volume::run(self, context, descriptor).await
            }
            JobDescriptor::CopyData(descriptor) => copy_data::run(self, context, descriptor).await,
        };

        let report = match result {
            Ok(()) => {
                event!(Level::INFO, "Job finished");
                JobStatusReport {
                    status: JobStatus::Done,
                    error: None,
                }
            }
            Err(error) if error.kind == JobErrorKind::Aborted => {
                event!(Level::INFO, "Job aborted");
                JobStatusReport {
                    status: JobStatus::Aborted,
                    error: Some(error),
                }
            }
            Err(error) => {
                event!(Level::WARN, %error, "Job failed");
                JobStatusReport {
                    status: JobStatus::Failed,
                    error: Some(error),
                }
            }
        };

        self.record.send_modify(|record| {
            record.report = report;
            record.finished_at = Some(Utc::now());
        });
    }
}

fn aborted_error() -> JobError {
    JobError::new(
        JobErrorKind::Aborted,
        "job was aborted before it started",
    )
}

pub(crate) fn mutation_failure(error: ImageToolError) -> JobError {
    JobError::new(JobErrorKind::MutationFailure, error.to_string())
}

pub(crate) fn image_format(format: VolumeFormat) -> ImageFormat {
    match format {
        VolumeFormat::Raw => ImageFormat::Raw,
        VolumeFormat::Cow => ImageFormat::Qcow2,
    }
}

/// What to do with the volume's legality when the mutation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnFailure {
    /// The mutation works on existing data and leaves it intact on failure;
    /// the volume is usable again. Such a mutation requires a legal volume.
    RestoreLegal,
    /// The mutation overwrites the data, which may be partially written on
    /// failure; the volume stays illegal. The volume may be illegal before.
    LeaveIllegal,
}

/// Run `mutation` against `volume` under the generation protocol.
///
/// Must be called with the exclusive lock on the volume's image held. The
/// generation is checked first (a stale `expected_generation` fails with
/// `Conflict` without touching the volume), then the volume is marked
/// illegal for the duration of the mutation. On success, the generation is
/// bumped by one and the volume marked legal in a single metadata update.
/// On failure, the generation is left alone and legality handled according
/// to `on_failure`.
///
/// With [`OnFailure::RestoreLegal`], an illegal volume is refused with
/// `Conflict`: its data may be corrupt and must not be declared legal.
pub(crate) async fn volume_operation<F>(
    volume: &dyn Volume,
    expected_generation: Option<u64>,
    on_failure: OnFailure,
    mutation: F,
) -> Result<(), JobError>
where
    F: Future<Output = Result<(), JobError>>,
{
    let generation = volume.generation().await?;
    if let Some(expected) = expected_generation {
        if expected != generation {
            return Err(JobError::new(
                JobErrorKind::Conflict,
                format!(
                    "volume {} is at generation {generation}, expected {expected}",
                    volume.key()
                ),
            ));
        }
    }

    if on_failure == OnFailure::RestoreLegal && volume.legality().await? != Legality::Legal {
        return Err(JobError::new(
            JobErrorKind::Conflict,
            format!("volume {} is illegal", volume.key()),
        ));
    }

    let next_generation = generation.checked_add(1).ok_or_else(|| {
        JobError::new(
            JobErrorKind::Internal,
            format!("volume {} generation overflow", volume.key()),
        )
    })?;

    event!(Level::DEBUG, volume = %volume.key(), generation, "Marking volume illegal");
    volume.set_legality(Legality::Illegal).await?;

    match mutation.await {
        Ok(()) => {
            volume
                .update_meta(&[
                    (MetaKey::Generation, next_generation.to_string()),
                    (MetaKey::Legality, Legality::Legal.to_string()),
                ])
                .await
                .map_err(|e| {
                    event!(Level::ERROR, volume = %volume.key(), error = %e, "Failed to commit volume metadata, volume left illegal");
                    JobError::from(e)
                })?;
            event!(Level::DEBUG, volume = %volume.key(), generation = next_generation, "Committed volume");
            Ok(())
        }
        Err(error) => {
            if on_failure == OnFailure::RestoreLegal {
                if let Err(e) = volume.set_legality(Legality::Legal).await {
                    event!(Level::ERROR, volume = %volume.key(), error = %e, "Failed to restore volume legality");
                    return Err(JobError::new(
                        JobErrorKind::Internal,
                        format!("{error}; restoring legality failed: {e}"),
                    ));
                }
            }
            Err(error)
        }
    }
}
