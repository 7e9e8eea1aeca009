//! Storage repository backed by a local (or mounted) file system.
//!
//! Layout below the repository root:
//!
//! ```text
//! <sd_id>/dom_md/metadata                 domain metadata (VERSION, ...)
//! <sd_id>/images/<img_id>/<vol_id>        volume data
//! <sd_id>/images/<img_id>/<vol_id>.meta   volume metadata
//! ```
//!
//! Metadata files use the `KEY=VALUE` / `EOF` encoding of
//! [`sdm_rs::volume::Metadata`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use sdm_rs::image::{ImageInfo, ImageTool, ImageToolError};
use sdm_rs::storage::{DomainResolver, StorageDomain, StorageError, Volume};
use sdm_rs::volume::{Legality, MetaKey, Metadata, VolumeFormat, VolumeKey};

const DOMAIN_MD_DIR: &str = "dom_md";
const DOMAIN_MD_FILE: &str = "metadata";
const IMAGES_DIR: &str = "images";
const DOMAIN_VERSION_KEY: &str = "VERSION";
const DOMAIN_UUID_KEY: &str = "SDUUID";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn read_metadata(path: &Path, what: impl FnOnce() -> String) -> Result<Metadata, StorageError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(io_error(path))?;
    Metadata::parse(&text).map_err(|e| StorageError::MetadataInvalid {
        what: what(),
        reason: e.to_string(),
    })
}

/// Replace `path` with `metadata` such that readers observe either the old or
/// the new contents, never a mix, and the new contents survive a crash once
/// this returns.
async fn write_metadata(path: &Path, metadata: &Metadata) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut tmp = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(io_error(&tmp_path))?;
    tmp.write_all(metadata.encode().as_bytes())
        .await
        .map_err(io_error(&tmp_path))?;
    tmp.sync_all().await.map_err(io_error(&tmp_path))?;
    drop(tmp);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(io_error(path))?;

    // Persist the rename itself:
    #[cfg(unix)]
    if let Some(dir) = path.parent() {
        tokio::fs::File::open(dir)
            .await
            .map_err(io_error(dir))?
            .sync_all()
            .await
            .map_err(io_error(dir))?;
    }

    Ok(())
}

/// Resolves storage domains stored as directories below a common root.
#[derive(Debug)]
pub struct FileRepository {
    root: PathBuf,
    image_tool: Arc<dyn ImageTool>,
}

impl FileRepository {
    pub fn new<P: Into<PathBuf>>(root: P, image_tool: Arc<dyn ImageTool>) -> Self {
        FileRepository {
            root: root.into(),
            image_tool,
        }
    }

    pub async fn domain(&self, storage_domain_id: Uuid) -> Result<FileDomain, StorageError> {
        FileDomain::open(&self.root, storage_domain_id, self.image_tool.clone()).await
    }
}

#[async_trait]
impl DomainResolver for FileRepository {
    async fn resolve(
        &self,
        storage_domain_id: Uuid,
    ) -> Result<Arc<dyn StorageDomain>, StorageError> {
        let domain = self.domain(storage_domain_id).await?;
        Ok(Arc::new(domain))
    }
}

#[derive(Debug)]
pub struct FileDomain {
    id: Uuid,
    version: u32,
    path: PathBuf,
    image_tool: Arc<dyn ImageTool>,
}

impl FileDomain {
    pub async fn open(
        root: &Path,
        id: Uuid,
        image_tool: Arc<dyn ImageTool>,
    ) -> Result<Self, StorageError> {
        let path = root.join(id.to_string());
        let md_path = path.join(DOMAIN_MD_DIR).join(DOMAIN_MD_FILE);

        let metadata = match read_metadata(&md_path, || format!("storage domain {id}")).await {
            Err(StorageError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return Err(StorageError::DomainNotFound(id));
            }
            other => other?,
        };

        let version = metadata
            .get(DOMAIN_VERSION_KEY)
            .ok_or_else(|| StorageError::MetadataInvalid {
                what: format!("storage domain {id}"),
                reason: format!("{DOMAIN_VERSION_KEY} is missing"),
            })?;
        let version = version.parse().map_err(|_| StorageError::MetadataInvalid {
            what: format!("storage domain {id}"),
            reason: format!("{DOMAIN_VERSION_KEY} {version:?} is not a number"),
        })?;

        Ok(FileDomain {
            id,
            version,
            path,
            image_tool,
        })
    }

    /// Initialize an empty storage domain below `root`.
    #[instrument(skip(image_tool))]
    pub async fn create(
        root: &Path,
        id: Uuid,
        version: u32,
        image_tool: Arc<dyn ImageTool>,
    ) -> Result<Self, StorageError> {
        let path = root.join(id.to_string());
        let md_dir = path.join(DOMAIN_MD_DIR);
        tokio::fs::create_dir_all(&md_dir)
            .await
            .map_err(io_error(&md_dir))?;
        let images_dir = path.join(IMAGES_DIR);
        tokio::fs::create_dir_all(&images_dir)
            .await
            .map_err(io_error(&images_dir))?;

        let mut metadata = Metadata::new();
        metadata.set(DOMAIN_UUID_KEY, id.to_string());
        metadata.set(DOMAIN_VERSION_KEY, version.to_string());
        write_metadata(&md_dir.join(DOMAIN_MD_FILE), &metadata).await?;

        event!(Level::INFO, %id, version, "Created storage domain");
        Ok(FileDomain {
            id,
            version,
            path,
            image_tool,
        })
    }

    fn volume_paths(&self, image_id: Uuid, volume_id: Uuid) -> (PathBuf, PathBuf) {
        let image_dir = self.path.join(IMAGES_DIR).join(image_id.to_string());
        let data = image_dir.join(volume_id.to_string());
        let meta = image_dir.join(format!("{volume_id}.meta"));
        (data, meta)
    }

    /// Provision a new, legal volume at generation 0.
    ///
    /// This allocates a sparse data file of `capacity` bytes and writes the
    /// initial metadata. Formatting the data file (e.g. as qcow2) is left to
    /// the caller.
    #[instrument(skip(self), fields(sd_id = %self.id))]
    pub async fn create_volume(
        &self,
        image_id: Uuid,
        volume_id: Uuid,
        format: VolumeFormat,
        capacity: u64,
    ) -> Result<FileVolume, StorageError> {
        let (data_path, meta_path) = self.volume_paths(image_id, volume_id);
        if let Some(image_dir) = data_path.parent() {
            tokio::fs::create_dir_all(image_dir)
                .await
                .map_err(io_error(image_dir))?;
        }

        let data = tokio::fs::File::create(&data_path)
            .await
            .map_err(io_error(&data_path))?;
        data.set_len(capacity)
            .await
            .map_err(io_error(&data_path))?;

        let mut metadata = Metadata::new();
        metadata.set(MetaKey::Format.as_str(), format.as_str());
        metadata.set(MetaKey::Legality.as_str(), Legality::Legal.as_str());
        metadata.set(MetaKey::Generation.as_str(), "0");
        metadata.set(MetaKey::Capacity.as_str(), capacity.to_string());
        metadata.set(MetaKey::Description.as_str(), "");
        metadata.set(
            MetaKey::Ctime.as_str(),
            chrono::Utc::now().timestamp().to_string(),
        );
        write_metadata(&meta_path, &metadata).await?;

        event!(Level::INFO, %image_id, %volume_id, %format, capacity, "Created volume");
        Ok(FileVolume {
            key: VolumeKey {
                storage_domain_id: self.id,
                image_id,
                volume_id,
            },
            path: data_path,
            meta_path,
            image_tool: self.image_tool.clone(),
        })
    }
}

#[async_trait]
impl StorageDomain for FileDomain {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn produce_volume(
        &self,
        image_id: Uuid,
        volume_id: Uuid,
    ) -> Result<Arc<dyn Volume>, StorageError> {
        let key = VolumeKey {
            storage_domain_id: self.id,
            image_id,
            volume_id,
        };
        let (path, meta_path) = self.volume_paths(image_id, volume_id);

        let exists = tokio::fs::try_exists(&meta_path)
            .await
            .map_err(io_error(&meta_path))?;
        if !exists {
            return Err(StorageError::VolumeNotFound(key));
        }

        Ok(Arc::new(FileVolume {
            key,
            path,
            meta_path,
            image_tool: self.image_tool.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct FileVolume {
    key: VolumeKey,
    path: PathBuf,
    meta_path: PathBuf,
    image_tool: Arc<dyn ImageTool>,
}

impl FileVolume {
    async fn metadata(&self) -> Result<Metadata, StorageError> {
        match read_metadata(&self.meta_path, || format!("volume {}", self.key)).await {
            Err(StorageError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Err(StorageError::VolumeNotFound(self.key))
            }
            other => other,
        }
    }
}

#[async_trait]
impl Volume for FileVolume {
    fn key(&self) -> &VolumeKey {
        &self.key
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn get_meta(&self, key: MetaKey) -> Result<String, StorageError> {
        self.metadata()
            .await?
            .get(key.as_str())
            .map(str::to_string)
            .ok_or(StorageError::MetadataMissing {
                volume: self.key,
                key: key.as_str(),
            })
    }

    async fn update_meta(&self, updates: &[(MetaKey, String)]) -> Result<(), StorageError> {
        let mut metadata = self.metadata().await?;
        for (key, value) in updates {
            event!(Level::TRACE, volume = %self.key, %key, %value, "Setting volume metadata");
            metadata.set(key.as_str(), value.as_str());
        }
        write_metadata(&self.meta_path, &metadata).await
    }

    async fn get_format_info(&self) -> Result<ImageInfo, ImageToolError> {
        self.image_tool.info(&self.path).await
    }
}
