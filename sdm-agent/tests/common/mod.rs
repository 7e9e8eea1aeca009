#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use sdm_agent::file_domain::{FileDomain, FileRepository};
use sdm_agent::guard::ResourceManager;
use sdm_agent::jobs::JobContext;
use sdm_rs::image::{
    ConvertOptions, ImageFormat, ImageInfo, ImageTool, ImageToolError, Qcow2Attributes,
    Qcow2Compat,
};
use sdm_rs::storage::{StorageDomain, Volume};
use sdm_rs::volume::VolumeFormat;

pub const DEFAULT_SIZE: u64 = 1048576;

/// Lets a test stop mutations mid-flight.
#[derive(Debug, Clone, Default)]
pub struct MutationGate {
    pub started: Arc<Notify>,
    pub resume: Arc<Notify>,
}

#[derive(Debug, Default)]
struct FakeState {
    images: HashMap<PathBuf, ImageInfo>,
    fail_amend: bool,
    fail_convert: bool,
    amend_calls: usize,
    convert_calls: Vec<ConvertOptions>,
    in_flight: usize,
    max_in_flight: usize,
    delay: Option<Duration>,
    gate: Option<MutationGate>,
}

/// In-memory stand-in for `qemu-img`, keyed by image path.
#[derive(Debug, Default)]
pub struct FakeImageTool {
    state: Mutex<FakeState>,
}

impl FakeImageTool {
    pub fn register(&self, path: &Path, info: ImageInfo) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(path.to_path_buf(), info);
    }

    pub fn fail_amend(&self) {
        self.state.lock().unwrap().fail_amend = true;
    }

    pub fn fail_convert(&self) {
        self.state.lock().unwrap().fail_convert = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn pause_mutations(&self) -> MutationGate {
        let gate = MutationGate::default();
        self.state.lock().unwrap().gate = Some(gate.clone());
        gate
    }

    pub fn amend_calls(&self) -> usize {
        self.state.lock().unwrap().amend_calls
    }

    pub fn convert_calls(&self) -> Vec<ConvertOptions> {
        self.state.lock().unwrap().convert_calls.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    async fn mutation_begin(&self) {
        let (delay, gate) = {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            (state.delay, state.gate.clone())
        };

        if let Some(gate) = gate {
            gate.started.notify_one();
            gate.resume.notified().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn mutation_end(&self) {
        self.state.lock().unwrap().in_flight -= 1;
    }

    fn failure(command: &str) -> ImageToolError {
        ImageToolError::Failed {
            command: format!("qemu-img {command}"),
            exit_code: Some(1),
            stdout: "out".to_string(),
            stderr: format!("Fail {command}"),
        }
    }
}

#[async_trait]
impl ImageTool for FakeImageTool {
    async fn info(&self, path: &Path) -> Result<ImageInfo, ImageToolError> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(path)
            .cloned()
            .ok_or_else(|| ImageToolError::Parse(format!("no such image {path:?}")))
    }

    async fn amend(&self, path: &Path, attrs: &Qcow2Attributes) -> Result<(), ImageToolError> {
        self.mutation_begin().await;

        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        state.amend_calls += 1;
        if state.fail_amend {
            return Err(Self::failure("amend"));
        }
        let info = state
            .images
            .get_mut(path)
            .ok_or_else(|| ImageToolError::Parse(format!("no such image {path:?}")))?;
        info.compat = Some(attrs.compat);
        Ok(())
    }

    async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        options: &ConvertOptions,
    ) -> Result<(), ImageToolError> {
        self.mutation_begin().await;

        let mut state = self.state.lock().unwrap();
        state.convert_calls.push(options.clone());
        if state.fail_convert {
            drop(state);
            self.mutation_end();
            return Err(Self::failure("convert"));
        }
        let virtual_size = state
            .images
            .get(src)
            .map(|info| info.virtual_size)
            .unwrap_or(DEFAULT_SIZE);
        state.images.insert(
            dst.to_path_buf(),
            ImageInfo {
                format: options.dst_format,
                virtual_size,
                compat: options.dst_compat,
            },
        );
        state.in_flight -= 1;
        Ok(())
    }
}

pub struct Env {
    _dir: TempDir,
    pub tool: Arc<FakeImageTool>,
    pub guard: Arc<ResourceManager>,
    pub repository: Arc<FileRepository>,
    pub domain: FileDomain,
}

pub async fn make_env(sd_version: u32) -> Env {
    let dir = tempfile::tempdir().unwrap();
    let tool = Arc::new(FakeImageTool::default());
    let domain = FileDomain::create(dir.path(), Uuid::new_v4(), sd_version, tool.clone())
        .await
        .unwrap();
    let repository = Arc::new(FileRepository::new(dir.path(), tool.clone()));

    Env {
        _dir: dir,
        tool,
        guard: Arc::new(ResourceManager::new()),
        repository,
        domain,
    }
}

impl Env {
    pub fn context(&self) -> JobContext {
        self.context_with_timeout(Duration::from_secs(5))
    }

    pub fn context_with_timeout(&self, lock_timeout: Duration) -> JobContext {
        JobContext {
            resolver: self.repository.clone(),
            guard: self.guard.clone(),
            image_tool: self.tool.clone(),
            lock_timeout,
        }
    }

    /// Create a volume in a new image, registered with the fake tool.
    pub async fn make_volume(&self, format: VolumeFormat, compat: Qcow2Compat) -> Arc<dyn Volume> {
        self.make_volume_in(Uuid::new_v4(), format, compat).await
    }

    pub async fn make_volume_in(
        &self,
        image_id: Uuid,
        format: VolumeFormat,
        compat: Qcow2Compat,
    ) -> Arc<dyn Volume> {
        let volume_id = Uuid::new_v4();
        let created = self
            .domain
            .create_volume(image_id, volume_id, format, DEFAULT_SIZE)
            .await
            .unwrap();

        let info = match format {
            VolumeFormat::Raw => ImageInfo {
                format: ImageFormat::Raw,
                virtual_size: DEFAULT_SIZE,
                compat: None,
            },
            VolumeFormat::Cow => ImageInfo {
                format: ImageFormat::Qcow2,
                virtual_size: DEFAULT_SIZE,
                compat: Some(compat),
            },
        };
        self.tool.register(created.path(), info);

        self.domain
            .produce_volume(image_id, volume_id)
            .await
            .unwrap()
    }
}
