use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use sdm_agent::jobs::Job;
use sdm_rs::api::jobs::{
    AmendVolumeDescriptor, CopyDataDescriptor, CopyOptions, JobDescriptor, JobErrorKind,
    JobStatus, VolumeEndpoint,
};
use sdm_rs::image::{Qcow2Attributes, Qcow2Compat};
use sdm_rs::resource::{LockMode, ResourceGuard, ResourceScope};
use sdm_rs::storage::Volume;
use sdm_rs::volume::{Legality, VolumeFormat};

mod common;
use common::make_env;

fn amend_job(volume: &dyn Volume, generation: u64, compat: Qcow2Compat) -> Job {
    let key = volume.key();
    Job::new(
        Uuid::new_v4(),
        0,
        JobDescriptor::AmendVolume(AmendVolumeDescriptor {
            storage_domain_id: key.storage_domain_id,
            image_id: key.image_id,
            volume_id: key.volume_id,
            expected_generation: generation,
            qcow2_attr: Qcow2Attributes { compat },
        }),
    )
}

async fn assert_untouched(volume: &dyn Volume, generation: u64, compat: Qcow2Compat) {
    assert_eq!(volume.legality().await.unwrap(), Legality::Legal);
    assert_eq!(volume.generation().await.unwrap(), generation);
    assert_eq!(
        volume.get_format_info().await.unwrap().compat,
        Some(compat)
    );
}

#[tokio::test]
async fn amend_upgrades_compat_and_bumps_generation() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    let generation = volume.generation().await.unwrap();

    let job = amend_job(volume.as_ref(), generation, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Done, "{status}");
    assert_eq!(status.error, None);
    assert_eq!(volume.legality().await.unwrap(), Legality::Legal);
    assert_eq!(volume.generation().await.unwrap(), generation + 1);
    assert_eq!(
        volume.get_format_info().await.unwrap().compat,
        Some(Qcow2Compat::V1_1)
    );
    assert_eq!(env.guard.active_scopes(), 0);
}

#[tokio::test]
async fn amend_to_current_compat_still_bumps_generation() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V1_1).await;

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    assert_eq!(job.status().status, JobStatus::Done);
    assert_eq!(volume.generation().await.unwrap(), 1);
    assert_eq!(env.tool.amend_calls(), 1);
}

#[tokio::test]
async fn consecutive_amends_track_generation() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;

    let first = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    first.run(&env.context()).await;
    let second = amend_job(volume.as_ref(), 1, Qcow2Compat::V0_10);
    second.run(&env.context()).await;

    assert_eq!(second.status().status, JobStatus::Done);
    assert_eq!(volume.generation().await.unwrap(), 2);
    assert_eq!(
        volume.get_format_info().await.unwrap().compat,
        Some(Qcow2Compat::V0_10)
    );
}

#[tokio::test]
async fn raw_volume_is_not_supported() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Raw, Qcow2Compat::V0_10).await;

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::NotSupported);
    assert_eq!(volume.legality().await.unwrap(), Legality::Legal);
    assert_eq!(volume.generation().await.unwrap(), 0);
    assert_eq!(env.tool.amend_calls(), 0);
}

#[tokio::test]
async fn old_domain_version_does_not_support_compat() {
    let env = make_env(3).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::NotSupported);
    assert_untouched(volume.as_ref(), 0, Qcow2Compat::V0_10).await;
    assert_eq!(env.tool.amend_calls(), 0);
}

#[tokio::test]
async fn old_domain_version_accepts_legacy_compat() {
    let env = make_env(3).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V0_10);
    job.run(&env.context()).await;

    assert_eq!(job.status().status, JobStatus::Done);
    assert_eq!(volume.generation().await.unwrap(), 1);
}

#[tokio::test]
async fn stale_generation_conflicts() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;

    let job = amend_job(volume.as_ref(), 5, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::Conflict);
    assert_untouched(volume.as_ref(), 0, Qcow2Compat::V0_10).await;
    assert_eq!(env.tool.amend_calls(), 0);
}

#[tokio::test]
async fn illegal_volume_is_refused() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    volume.set_legality(Legality::Illegal).await.unwrap();

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::Conflict);
    assert_eq!(volume.legality().await.unwrap(), Legality::Illegal);
    assert_eq!(volume.generation().await.unwrap(), 0);
    assert_eq!(env.tool.amend_calls(), 0);
}

#[tokio::test]
async fn failed_copy_destination_stays_illegal() {
    let env = make_env(4).await;
    let src = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V1_1).await;
    let dst = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    env.tool.fail_convert();
    env.tool.fail_amend();

    let endpoint = |volume: &dyn Volume| {
        let key = volume.key();
        VolumeEndpoint {
            storage_domain_id: key.storage_domain_id,
            image_id: key.image_id,
            volume_id: key.volume_id,
            expected_generation: None,
        }
    };
    let copy = Job::new(
        Uuid::new_v4(),
        0,
        JobDescriptor::CopyData(CopyDataDescriptor {
            source: endpoint(src.as_ref()),
            destination: endpoint(dst.as_ref()),
            options: CopyOptions::default(),
        }),
    );
    copy.run(&env.context()).await;
    assert_eq!(copy.status().status, JobStatus::Failed);
    assert_eq!(dst.legality().await.unwrap(), Legality::Illegal);

    let job = amend_job(dst.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::Conflict);
    assert_eq!(dst.legality().await.unwrap(), Legality::Illegal);
    assert_eq!(dst.generation().await.unwrap(), 0);
    assert_eq!(env.tool.amend_calls(), 0);
}

#[tokio::test]
async fn tool_failure_restores_legality() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    env.tool.fail_amend();

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, JobErrorKind::MutationFailure);
    assert!(error.message.contains("Fail amend"), "{}", error.message);
    assert_untouched(volume.as_ref(), 0, Qcow2Compat::V0_10).await;
    assert_eq!(env.guard.active_scopes(), 0);
}

#[tokio::test]
async fn volume_is_illegal_while_amending() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    let gate = env.tool.pause_mutations();

    let job = Arc::new(amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1));
    let context = env.context();
    let task = tokio::spawn({
        let job = job.clone();
        async move { job.run(&context).await }
    });

    gate.started.notified().await;
    assert_eq!(job.status().status, JobStatus::Running);
    assert_eq!(volume.legality().await.unwrap(), Legality::Illegal);
    assert_eq!(volume.generation().await.unwrap(), 0);
    // Aborting past the checkpoints has no effect:
    job.abort().unwrap();

    gate.resume.notify_one();
    task.await.unwrap();

    assert_eq!(job.status().status, JobStatus::Done);
    assert_eq!(volume.legality().await.unwrap(), Legality::Legal);
    assert_eq!(volume.generation().await.unwrap(), 1);
}

#[tokio::test]
async fn held_lock_times_out() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    let key = volume.key();

    let held = env
        .guard
        .acquire(
            &ResourceScope::image(key.storage_domain_id, key.image_id),
            LockMode::Shared,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context_with_timeout(Duration::from_millis(50)))
        .await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::LockTimeout);
    assert_untouched(volume.as_ref(), 0, Qcow2Compat::V0_10).await;
    drop(held);
}

#[tokio::test]
async fn lock_on_other_image_does_not_block() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    let key = volume.key();

    let _held = env
        .guard
        .acquire(
            &ResourceScope::image(key.storage_domain_id, Uuid::new_v4()),
            LockMode::Exclusive,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context_with_timeout(Duration::from_millis(50)))
        .await;

    assert_eq!(job.status().status, JobStatus::Done);
}

#[tokio::test]
async fn abort_while_waiting_for_lock() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    let key = volume.key();

    let held = env
        .guard
        .acquire(
            &ResourceScope::image(key.storage_domain_id, key.image_id),
            LockMode::Exclusive,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    let job = Arc::new(amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1));
    let context = env.context();
    let task = tokio::spawn({
        let job = job.clone();
        async move { job.run(&context).await }
    });

    // Let the job block on the lock:
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(job.status().status, JobStatus::Running);
    job.abort().unwrap();
    drop(held);
    task.await.unwrap();

    let status = job.status();
    assert_eq!(status.status, JobStatus::Aborted);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::Aborted);
    assert_untouched(volume.as_ref(), 0, Qcow2Compat::V0_10).await;
    assert_eq!(env.tool.amend_calls(), 0);
}

#[tokio::test]
async fn abort_pending_job() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.abort().unwrap();
    assert_eq!(job.status().status, JobStatus::Aborted);

    // Running an aborted job does nothing:
    job.run(&env.context()).await;
    assert_eq!(job.status().status, JobStatus::Aborted);
    assert_eq!(env.tool.amend_calls(), 0);
    assert!(job.abort().is_err());
}

#[tokio::test]
async fn finished_job_cannot_be_rerun() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;

    let job = amend_job(volume.as_ref(), 0, Qcow2Compat::V1_1);
    job.run(&env.context()).await;
    job.run(&env.context()).await;

    assert_eq!(job.status().status, JobStatus::Done);
    assert_eq!(volume.generation().await.unwrap(), 1);
    assert_eq!(env.tool.amend_calls(), 1);
}

#[tokio::test]
async fn missing_volume_is_not_found() {
    let env = make_env(4).await;
    let volume = env.make_volume(VolumeFormat::Cow, Qcow2Compat::V0_10).await;
    let key = volume.key();

    let job = Job::new(
        Uuid::new_v4(),
        0,
        JobDescriptor::AmendVolume(AmendVolumeDescriptor {
            storage_domain_id: key.storage_domain_id,
            image_id: key.image_id,
            volume_id: Uuid::new_v4(),
            expected_generation: 0,
            qcow2_attr: Qcow2Attributes {
                compat: Qcow2Compat::V1_1,
            },
        }),
    );
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::NotFound);
}

#[tokio::test]
async fn missing_domain_is_not_found() {
    let env = make_env(4).await;

    let job = Job::new(
        Uuid::new_v4(),
        0,
        JobDescriptor::AmendVolume(AmendVolumeDescriptor {
            storage_domain_id: Uuid::new_v4(),
            image_id: Uuid::new_v4(),
            volume_id: Uuid::new_v4(),
            expected_generation: 0,
            qcow2_attr: Qcow2Attributes {
                compat: Qcow2Compat::V1_1,
            },
        }),
    );
    job.run(&env.context()).await;

    let status = job.status();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, JobErrorKind::NotFound);
}
