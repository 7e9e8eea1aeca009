//! Amend qcow2 attributes (compat level) of a volume in place.

use tracing::{event, Level};

use sdm_rs::api::jobs::{AmendVolumeDescriptor, JobError, JobErrorKind};
use sdm_rs::resource::{LockMode, ResourceScope};
use sdm_rs::volume::VolumeFormat;

use super::{mutation_failure, volume_operation, Job, JobContext, OnFailure};
use crate::guard::{GuardedContext, LockRequest};

pub(crate) async fn run(
    job: &Job,
    context: &JobContext,
    descriptor: &AmendVolumeDescriptor,
) -> Result<(), JobError> {
    job.check_aborted()?;

    let domain = context
        .resolver
        .resolve(descriptor.storage_domain_id)
        .await?;
    let volume = domain
        .produce_volume(descriptor.image_id, descriptor.volume_id)
        .await?;

    // Held until we return, on every path:
    let _locks = GuardedContext::acquire(
        context.guard.as_ref(),
        vec![LockRequest::new(
            ResourceScope::image(descriptor.storage_domain_id, descriptor.image_id),
            LockMode::Exclusive,
        )],
        context.lock_timeout,
    )
    .await?;

    job.check_aborted()?;

    let format = volume.format().await?;
    if format != VolumeFormat::Cow {
        return Err(JobError::new(
            JobErrorKind::NotSupported,
            format!(
                "volume {} has format {format}, only {} volumes can be amended",
                volume.key(),
                VolumeFormat::Cow
            ),
        ));
    }

    let compat = descriptor.qcow2_attr.compat;
    if !domain.supports_qcow2_compat(compat) {
        return Err(JobError::new(
            JobErrorKind::NotSupported,
            format!(
                "storage domain {} (version {}) does not support qcow2 compat {compat}",
                domain.id(),
                domain.version()
            ),
        ));
    }

    event!(Level::INFO, volume = %volume.key(), %compat, "Amending volume");
    volume_operation(
        volume.as_ref(),
        Some(descriptor.expected_generation),
        OnFailure::RestoreLegal,
        async {
            context
                .image_tool
                .amend(volume.path(), &descriptor.qcow2_attr)
                .await
                .map_err(mutation_failure)
        },
    )
    .await
}
