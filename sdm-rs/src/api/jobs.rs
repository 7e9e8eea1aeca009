use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::image::{Preallocation, Qcow2Attributes, Qcow2Compat};
use crate::resource::LockError;
use crate::storage::StorageError;
use crate::volume::VolumeKey;

/// Job submission descriptor, tagged by the kind of mutation requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "endpoint_type", rename_all = "snake_case")]
pub enum JobDescriptor {
    AmendVolume(AmendVolumeDescriptor),
    CopyData(CopyDataDescriptor),
}

impl JobDescriptor {
    pub fn endpoint_type(&self) -> &'static str {
        match self {
            JobDescriptor::AmendVolume(_) => "amend_volume",
            JobDescriptor::CopyData(_) => "copy_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendVolumeDescriptor {
    pub storage_domain_id: Uuid,
    pub image_id: Uuid,
    pub volume_id: Uuid,
    /// Generation the caller last observed. The job fails with
    /// [`JobErrorKind::Conflict`] if the volume has moved on since.
    pub expected_generation: u64,
    pub qcow2_attr: Qcow2Attributes,
}

impl AmendVolumeDescriptor {
    pub fn volume_key(&self) -> VolumeKey {
        VolumeKey {
            storage_domain_id: self.storage_domain_id,
            image_id: self.image_id,
            volume_id: self.volume_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEndpoint {
    pub storage_domain_id: Uuid,
    pub image_id: Uuid,
    pub volume_id: Uuid,
    #[serde(default)]
    pub expected_generation: Option<u64>,
}

impl VolumeEndpoint {
    pub fn volume_key(&self) -> VolumeKey {
        VolumeKey {
            storage_domain_id: self.storage_domain_id,
            image_id: self.image_id,
            volume_id: self.volume_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    /// Compat level for a qcow2 destination. Defaults to the newest level
    /// the destination domain supports.
    #[serde(default)]
    pub compat: Option<Qcow2Compat>,
    #[serde(default)]
    pub preallocation: Option<Preallocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyDataDescriptor {
    pub source: VolumeEndpoint,
    pub destination: VolumeEndpoint,
    #[serde(default)]
    pub options: CopyOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobErrorKind {
    /// The operation does not apply to the volume's format or to the
    /// storage domain's version. The volume was not touched.
    NotSupported,

    /// The caller's expected generation is stale. The volume was not
    /// touched.
    Conflict,

    /// Access to the volume could not be serialized in time.
    LockTimeout,

    /// Access to the volume could not be serialized.
    LockError,

    /// The image tool failed while mutating the volume.
    MutationFailure,

    /// A storage domain or volume referenced by the job does not exist.
    NotFound,

    /// The job was cancelled before it began mutating anything.
    Aborted,

    /// Reading or writing volume metadata failed.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        JobError {
            kind,
            message: message.into(),
        }
    }
}

impl From<LockError> for JobError {
    fn from(err: LockError) -> Self {
        let kind = match err {
            LockError::Timeout { .. } => JobErrorKind::LockTimeout,
            LockError::Failed { .. } => JobErrorKind::LockError,
        };
        JobError::new(kind, err.to_string())
    }
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        let kind = match err {
            StorageError::DomainNotFound(_) | StorageError::VolumeNotFound(_) => {
                JobErrorKind::NotFound
            }
            _ => JobErrorKind::Internal,
        };
        JobError::new(kind, err.to_string())
    }
}

/// Result of a job status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub error: Option<JobError>,
}

impl JobStatusReport {
    pub fn pending() -> Self {
        JobStatusReport {
            status: JobStatus::Pending,
            error: None,
        }
    }
}

impl fmt::Display for JobStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{:?} ({})", self.status, error),
            None => write!(f, "{:?}", self.status),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub priority: i32,
    pub endpoint_type: String,
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
