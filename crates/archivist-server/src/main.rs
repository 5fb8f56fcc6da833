use std::{path::PathBuf, sync::Arc, time::Duration};

use archivist_api::{AppState, ArchiveGateway, LinkSigner, LinkSignerConfig, archive_router};
use archivist_assembler::{
    ArchiveAssembler, ArchivePipeline, AssemblerConfig, AssemblyMode, Part10Converter,
};
use archivist_crypto::MasterKey;
use archivist_dataset::{DatasetStore, JsonDatasetStore, StatusTracker, tracker::DEFAULT_RETENTION_DAYS};
use archivist_jobs::{JobScheduler, MemoryJobStore, SchedulerConfig, scheduler::DEFAULT_CONCURRENCY};
use archivist_lifecycle::{ExpirationSweeper, SweeperConfig};
use archivist_source::{HttpDatasetSource, SourceConfig};
use archivist_storage::{
    ArchiveUploader, LocalObjectLayer, ObjectLayer, StorageClass, UploaderConfig,
};
use clap::{ArgAction, Parser};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "archivist", about = "Archive creation and storage service for imaging studies")]
struct Cli {
    #[arg(long, env = "ARCHIVIST_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "ARCHIVIST_PORT", default_value = "8080")]
    port: u16,

    #[arg(long, env = "ARCHIVIST_DATA_DIR", default_value = "./data")]
    data_dir: String,

    #[arg(long, env = "ARCHIVIST_BUCKET", default_value = "archives")]
    bucket: String,

    /// Maximum number of archive jobs running at once.
    #[arg(long, env = "ARCHIVIST_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    #[arg(long, env = "ARCHIVIST_RETENTION_DAYS", default_value_t = DEFAULT_RETENTION_DAYS)]
    retention_days: i64,

    /// `export` streams the source's archive, `local` converts each instance.
    #[arg(long, env = "ARCHIVIST_ASSEMBLY_MODE", default_value = "export")]
    assembly_mode: AssemblyMode,

    #[arg(long, env = "ARCHIVIST_SOURCE_URL", default_value = "http://127.0.0.1:8042")]
    source_url: String,

    #[arg(long, env = "ARCHIVIST_SOURCE_USERNAME")]
    source_username: Option<String>,

    #[arg(long, env = "ARCHIVIST_SOURCE_PASSWORD", hide_env_values = true)]
    source_password: Option<String>,

    #[arg(long, env = "ARCHIVIST_EXPORT_TIMEOUT_SECS", default_value_t = 600)]
    export_timeout_secs: u64,

    #[arg(long, env = "ARCHIVIST_UPLOAD_TIMEOUT_SECS", default_value_t = 300)]
    upload_timeout_secs: u64,

    #[arg(long, env = "ARCHIVIST_PART_SIZE_MB", default_value_t = 5)]
    part_size_mb: usize,

    #[arg(long, env = "ARCHIVIST_STORAGE_CLASS", default_value = "STANDARD")]
    storage_class: StorageClass,

    #[arg(long, env = "ARCHIVIST_SSE", default_value_t = true, action = ArgAction::Set)]
    sse: bool,

    #[arg(long, env = "ARCHIVIST_SWEEP_INTERVAL_SECS", default_value_t = 3600)]
    sweep_interval_secs: u64,

    #[arg(long, env = "ARCHIVIST_SWEEP_MAX_ATTEMPTS", default_value_t = 5)]
    sweep_max_attempts: u32,

    /// Base URL used in download links. Defaults to http://{host}:{port}.
    #[arg(long, env = "ARCHIVIST_PUBLIC_URL")]
    public_url: Option<String>,

    #[arg(long, env = "ARCHIVIST_LINK_TTL_SECS", default_value_t = 900)]
    link_ttl_secs: u64,

    #[arg(long, env = "ARCHIVIST_SIGNING_SECRET", hide_env_values = true)]
    signing_secret: Option<String>,

    /// Hex encoded 32 byte key for encryption at rest.
    #[arg(long, env = "ARCHIVIST_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    #[arg(long, env = "ARCHIVIST_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env().add_directive("archivist=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let addr = format!("{}:{}", cli.host, cli.port);
    let data_dir = PathBuf::from(&cli.data_dir);
    let work_dir = data_dir.join("work");
    tokio::fs::create_dir_all(&work_dir).await?;

    let master_key = match cli.master_key.as_deref() {
        Some(encoded) => MasterKey::from_hex(encoded)?,
        None => {
            warn!("no master key configured, encrypted archives will not survive a restart");
            MasterKey::generate()?
        }
    };
    let object_layer: Arc<dyn ObjectLayer> =
        Arc::new(LocalObjectLayer::new(data_dir.join("objects"), Some(master_key)).await?);
    object_layer.make_bucket(&cli.bucket).await?;

    let datasets: Arc<dyn DatasetStore> =
        Arc::new(JsonDatasetStore::new(data_dir.join("datasets")).await?);
    let tracker = StatusTracker::new(
        Arc::clone(&datasets),
        chrono::Duration::days(cli.retention_days),
    );

    let export_timeout = Duration::from_secs(cli.export_timeout_secs);
    let source = HttpDatasetSource::new(SourceConfig {
        username: cli.source_username.clone(),
        password: cli.source_password.clone(),
        export_timeout,
        ..SourceConfig::new(Url::parse(&cli.source_url)?)
    })?;
    let assembler = ArchiveAssembler::new(
        Arc::new(source),
        Arc::new(Part10Converter),
        AssemblerConfig {
            mode: cli.assembly_mode,
            export_timeout,
            work_dir: Some(work_dir),
        },
    );
    let uploader = ArchiveUploader::new(
        Arc::clone(&object_layer),
        UploaderConfig {
            bucket: cli.bucket.clone(),
            part_size: cli.part_size_mb.max(1) * 1024 * 1024,
            operation_timeout: Duration::from_secs(cli.upload_timeout_secs),
            storage_class: cli.storage_class,
            server_side_encryption: cli.sse,
        },
    );
    let pipeline = Arc::new(ArchivePipeline::new(assembler, uploader, tracker.clone()));

    let scheduler = JobScheduler::new(
        Arc::new(MemoryJobStore::new()),
        SchedulerConfig {
            concurrency: cli.concurrency,
        },
    );
    scheduler.start(pipeline);
    info!(
        concurrency = scheduler.concurrency(),
        mode = %cli.assembly_mode,
        "archive scheduler started"
    );

    let sweeper = Arc::new(ExpirationSweeper::new(
        datasets,
        Arc::clone(&object_layer),
        SweeperConfig {
            bucket: cli.bucket.clone(),
            interval: Duration::from_secs(cli.sweep_interval_secs),
            max_attempts: cli.sweep_max_attempts,
        },
    ));
    let background_sweeper = Arc::clone(&sweeper);
    tokio::spawn(async move {
        background_sweeper.run_loop().await;
    });
    info!("expiration sweeper enabled");

    let mut link_config = LinkSignerConfig {
        public_url: cli
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{addr}")),
        ttl: Duration::from_secs(cli.link_ttl_secs),
        ..LinkSignerConfig::default()
    };
    match cli.signing_secret.as_deref() {
        Some(secret) => link_config.secret = secret.as_bytes().to_vec(),
        None => warn!("no signing secret configured, download links will not survive a restart"),
    }
    let signer = LinkSigner::new(link_config);

    let gateway = Arc::new(ArchiveGateway::new(tracker, scheduler.clone(), signer.clone()));
    let state = Arc::new(AppState {
        gateway,
        scheduler,
        object_layer,
        bucket: cli.bucket,
        signer,
        sweeper,
    });
    let app = archive_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("archivist server listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
