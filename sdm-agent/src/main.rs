use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sdm_agent::config;
use sdm_agent::file_domain::FileRepository;
use sdm_agent::guard::ResourceManager;
use sdm_agent::jobs::{Job, JobContext};
use sdm_agent::qemu_img::QemuImg;
use sdm_agent::scheduler::Scheduler;
use sdm_rs::api::jobs::{JobDescriptor, JobStatus};
use sdm_rs::image::ImageTool;
use sdm_rs::storage::DomainResolver;

#[derive(Parser, Debug)]
#[command(version, about = "Storage domain job agent")]
struct AgentArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "SDM_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: AgentCommand,
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    /// Run a single job from a JSON descriptor file and print its final
    /// status.
    Run {
        descriptor: PathBuf,

        /// Job id, generated if not given
        #[arg(long)]
        job_id: Option<Uuid>,

        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// Print a volume's metadata and on-disk format information.
    Info {
        storage_domain_id: Uuid,
        image_id: Uuid,
        volume_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AgentArgs::parse();

    let config = config::load_configuration(&args.config)
        .with_context(|| format!("Loading configuration from {:?}", args.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_writer(std::io::stderr)
        .init();
    event!(Level::INFO, repository = ?config.storage.repository, "Storage domain job agent starting");

    let image_tool: Arc<dyn ImageTool> = Arc::new(QemuImg::new(&config.qemu_img));
    let repository = Arc::new(FileRepository::new(
        config.storage.repository.clone(),
        image_tool.clone(),
    ));

    match args.command {
        AgentCommand::Run {
            descriptor,
            job_id,
            priority,
        } => {
            let descriptor_bytes = tokio::fs::read(&descriptor)
                .await
                .with_context(|| format!("Reading job descriptor {:?}", descriptor))?;
            let job_descriptor: JobDescriptor = serde_json::from_slice(&descriptor_bytes)
                .with_context(|| format!("Parsing job descriptor {:?}", descriptor))?;

            let scheduler = Scheduler::new(
                JobContext {
                    resolver: repository,
                    guard: Arc::new(ResourceManager::new()),
                    image_tool,
                    lock_timeout: config.locks.acquire_timeout,
                },
                &config.jobs,
            );

            let job_id = scheduler
                .submit(Job::new(
                    job_id.unwrap_or_else(Uuid::new_v4),
                    priority,
                    job_descriptor,
                ))
                .await?;
            let report = scheduler.wait(job_id).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status != JobStatus::Done {
                std::process::exit(1);
            }
        }

        AgentCommand::Info {
            storage_domain_id,
            image_id,
            volume_id,
        } => {
            let domain = repository.resolve(storage_domain_id).await?;
            let volume = domain.produce_volume(image_id, volume_id).await?;
            let image_info = volume
                .get_format_info()
                .await
                .with_context(|| format!("Inspecting volume {}", volume.key()))?;

            let output = serde_json::json!({
                "volume": volume.key(),
                "domain_version": domain.version(),
                "format": volume.format().await?,
                "legality": volume.legality().await?,
                "generation": volume.generation().await?,
                "image": image_info,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
