//! Collaborator traits for storage domains and the volumes they hold.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::image::{ImageInfo, ImageToolError, Qcow2Compat};
use crate::volume::{Legality, MetaKey, VolumeFormat, VolumeKey};

/// First storage domain version whose volumes may use qcow2 compat 1.1.
pub const QCOW2_V3_MIN_DOMAIN_VERSION: u32 = 4;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage domain {0} not found")]
    DomainNotFound(Uuid),
    #[error("volume {0} not found")]
    VolumeNotFound(VolumeKey),
    #[error("volume {volume}: metadata key {key} is missing")]
    MetadataMissing { volume: VolumeKey, key: &'static str },
    #[error("{what}: invalid metadata: {reason}")]
    MetadataInvalid { what: String, reason: String },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Live reference to a single volume.
///
/// All metadata writes are durable once the call returns. `update_meta`
/// replaces every given field in one atomic step: a concurrent or later
/// reader sees either all of them or none.
///
/// Metadata may only be mutated while holding the exclusive lock on the
/// volume's image scope.
#[async_trait]
pub trait Volume: Send + Sync + fmt::Debug {
    fn key(&self) -> &VolumeKey;

    /// Path of the volume data, as handed to the image tool.
    fn path(&self) -> &Path;

    async fn get_meta(&self, key: MetaKey) -> Result<String, StorageError>;

    async fn update_meta(&self, updates: &[(MetaKey, String)]) -> Result<(), StorageError>;

    /// Inspect the on-disk format parameters through the image tool.
    async fn get_format_info(&self) -> Result<ImageInfo, ImageToolError>;

    async fn set_meta(&self, key: MetaKey, value: String) -> Result<(), StorageError> {
        self.update_meta(&[(key, value)]).await
    }

    async fn generation(&self) -> Result<u64, StorageError> {
        let value = self.get_meta(MetaKey::Generation).await?;
        value.parse().map_err(|_| StorageError::MetadataInvalid {
            what: format!("volume {}", self.key()),
            reason: format!("generation {value:?} is not a number"),
        })
    }

    async fn legality(&self) -> Result<Legality, StorageError> {
        let value = self.get_meta(MetaKey::Legality).await?;
        value.parse().map_err(|e| StorageError::MetadataInvalid {
            what: format!("volume {}", self.key()),
            reason: format!("{e}"),
        })
    }

    async fn format(&self) -> Result<VolumeFormat, StorageError> {
        let value = self.get_meta(MetaKey::Format).await?;
        value.parse().map_err(|e| StorageError::MetadataInvalid {
            what: format!("volume {}", self.key()),
            reason: format!("{e}"),
        })
    }

    async fn set_legality(&self, legality: Legality) -> Result<(), StorageError> {
        self.set_meta(MetaKey::Legality, legality.to_string()).await
    }
}

#[async_trait]
pub trait StorageDomain: Send + Sync + fmt::Debug {
    fn id(&self) -> Uuid;

    /// Storage domain format version.
    fn version(&self) -> u32;

    fn supports_qcow2_compat(&self, compat: Qcow2Compat) -> bool {
        match compat {
            Qcow2Compat::V0_10 => true,
            Qcow2Compat::V1_1 => self.version() >= QCOW2_V3_MIN_DOMAIN_VERSION,
        }
    }

    async fn produce_volume(
        &self,
        image_id: Uuid,
        volume_id: Uuid,
    ) -> Result<Arc<dyn Volume>, StorageError>;
}

/// Resolves storage domain ids to domain handles.
#[async_trait]
pub trait DomainResolver: Send + Sync + fmt::Debug + 'static {
    async fn resolve(&self, storage_domain_id: Uuid) -> Result<Arc<dyn StorageDomain>, StorageError>;
}
