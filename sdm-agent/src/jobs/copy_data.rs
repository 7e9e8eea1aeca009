//! Copy the data of one volume into another, converting the image format
//! as needed.

use tracing::{event, Level};

use sdm_rs::api::jobs::{CopyDataDescriptor, JobError, JobErrorKind};
use sdm_rs::image::{ConvertOptions, ImageFormat, Qcow2Compat};
use sdm_rs::resource::{LockMode, ResourceScope};
use sdm_rs::volume::Legality;

use super::{image_format, mutation_failure, volume_operation, Job, JobContext, OnFailure};
use crate::guard::{GuardedContext, LockRequest};

pub(crate) async fn run(
    job: &Job,
    context: &JobContext,
    descriptor: &CopyDataDescriptor,
) -> Result<(), JobError> {
    job.check_aborted()?;

    let source = &descriptor.source;
    let destination = &descriptor.destination;
    if source.volume_key() == destination.volume_key() {
        return Err(JobError::new(
            JobErrorKind::NotSupported,
            format!("cannot copy volume {} onto itself", source.volume_key()),
        ));
    }

    let src_domain = context.resolver.resolve(source.storage_domain_id).await?;
    let src_volume = src_domain
        .produce_volume(source.image_id, source.volume_id)
        .await?;
    let dst_domain = context
        .resolver
        .resolve(destination.storage_domain_id)
        .await?;
    let dst_volume = dst_domain
        .produce_volume(destination.image_id, destination.volume_id)
        .await?;

    // If both volumes belong to the same image, the context merges the two
    // requests into a single exclusive lock.
    let _locks = GuardedContext::acquire(
        context.guard.as_ref(),
        vec![
            LockRequest::new(
                ResourceScope::image(source.storage_domain_id, source.image_id),
                LockMode::Shared,
            ),
            LockRequest::new(
                ResourceScope::image(destination.storage_domain_id, destination.image_id),
                LockMode::Exclusive,
            ),
        ],
        context.lock_timeout,
    )
    .await?;

    job.check_aborted()?;

    if let Some(expected) = source.expected_generation {
        let generation = src_volume.generation().await?;
        if generation != expected {
            return Err(JobError::new(
                JobErrorKind::Conflict,
                format!(
                    "source volume {} is at generation {generation}, expected {expected}",
                    src_volume.key()
                ),
            ));
        }
    }
    if src_volume.legality().await? != Legality::Legal {
        return Err(JobError::new(
            JobErrorKind::Conflict,
            format!("source volume {} is illegal", src_volume.key()),
        ));
    }

    let src_format = image_format(src_volume.format().await?);
    let dst_format = image_format(dst_volume.format().await?);

    let dst_compat = match dst_format {
        ImageFormat::Raw => None,
        ImageFormat::Qcow2 => {
            let compat = descriptor.options.compat.unwrap_or(
                if dst_domain.supports_qcow2_compat(Qcow2Compat::V1_1) {
                    Qcow2Compat::V1_1
                } else {
                    Qcow2Compat::V0_10
                },
            );
            if !dst_domain.supports_qcow2_compat(compat) {
                return Err(JobError::new(
                    JobErrorKind::NotSupported,
                    format!(
                        "storage domain {} (version {}) does not support qcow2 compat {compat}",
                        dst_domain.id(),
                        dst_domain.version()
                    ),
                ));
            }
            Some(compat)
        }
    };

    let options = ConvertOptions {
        src_format,
        dst_format,
        dst_compat,
        preallocation: descriptor.options.preallocation,
    };

    event!(Level::INFO, source = %src_volume.key(), destination = %dst_volume.key(), ?options, "Copying volume data");
    volume_operation(
        dst_volume.as_ref(),
        destination.expected_generation,
        OnFailure::LeaveIllegal,
        async {
            context
                .image_tool
                .convert(src_volume.path(), dst_volume.path(), &options)
                .await
                .map_err(mutation_failure)
        },
    )
    .await
}
