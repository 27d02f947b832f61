use std::num::NonZeroU32;
use std::sync::Arc;

use aws_lc_rs::pbkdf2;
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use clap::Parser;
use ltm::cli::{config_check, Cli, Commands};
use ltm::cloud::{GceComputeClient, GceMetadataClient, GcsStorageClient, MetadataClient, StorageClient};
use ltm::frontend::{self, FrontendState};
use ltm::run::mailer::{ReportMailer, SendgridMailer};
use ltm::run::RunManagerConfig;
use ltm::sighup::Sighup;
use ltm::unique_id::UniqueIdAllocator;
use ltm::{config as ltm_config_singleton, healthcheck};
use ltm_config::EnvConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PBKDF2_ITERATIONS: u32 = 234_567;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).json().init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ConfigCheck => {
            if let Err(e) = config_check(&cli.env_config, &cli.catalog_root, &cli.default_fs) {
                error!("config check failed: {e}");
                std::process::exit(1);
            }
            info!("config check passed");
        }
        Commands::Serve { port } => {
            if let Err(e) = serve(cli, port).await {
                error!("fatal error: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn serve(cli: Cli, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let env = EnvConfig::load(&cli.env_config).unwrap_or_default();
    let settings = ltm_config_singleton::Settings {
        env,
        catalog_root: cli.catalog_root.clone(),
        default_fs: cli.default_fs.clone(),
        state_dir: cli.state_dir.clone(),
        user: "ltm".to_string(),
    };
    let settings = ltm_config_singleton::load(&cli.env_config, settings)?;
    let catalog = settings.catalog()?;

    let metadata = GceMetadataClient::new(cli.state_dir.join("metadata-cache"));
    let gce_project = metadata.project_value("project-id").await.unwrap_or_default();
    let gce_zone = metadata.instance_value("zone").await.unwrap_or_default();
    let gce_region = gce_zone.rsplit_once('-').map(|(r, _)| r.to_string()).unwrap_or_default();

    let compute: Arc<dyn ltm::cloud::ComputeClient> = Arc::new(GceComputeClient::new(gce_project.clone()));
    let bucket = std::env::var("GCE_GS_BUCKET").unwrap_or_else(|_| "xfstests".to_string());
    let storage: Arc<dyn StorageClient> = Arc::new(GcsStorageClient::new(bucket.clone()));

    let mailer: Option<Arc<dyn ReportMailer>> = settings
        .env
        .sendgrid_api_key
        .clone()
        .map(|key| Arc::new(SendgridMailer::new(key, settings.env.report_sender.clone().unwrap_or_default())) as Arc<dyn ReportMailer>);

    let allocator = Arc::new(UniqueIdAllocator::load(cli.state_dir.join("unique_id.state")).await?);

    let (password_hash, password_salt) = initial_password_hash(storage.as_ref()).await;

    let run_manager_config = RunManagerConfig {
        user: settings.user.clone(),
        log_root: cli.state_dir.join("logs"),
        gce_project,
        gce_region,
        gce_zone_default: (!gce_zone.is_empty()).then_some(gce_zone),
        gs_bucket: bucket,
        bucket_subdir: settings.env.bucket_subdir.clone(),
        image_project: std::env::var("GCE_IMAGE_PROJECT").unwrap_or_default(),
        keep_dead_vm: settings.env.keep_dead_vm,
        region_shard: true,
        max_shards: 0,
        gs_kernel: None,
        upload_summary: settings.env.upload_summary,
        report_email: None,
    };

    let state = Arc::new(FrontendState::new(
        password_hash,
        password_salt,
        catalog,
        allocator,
        compute,
        storage,
        mailer,
        run_manager_config,
    ));

    let health_port = port.saturating_add(1);
    tokio::spawn(healthcheck::server(health_port));

    let env_config_path = cli.env_config.clone();
    tokio::spawn(async move {
        let mut sighup = Sighup::new().expect("failed to install SIGHUP handler");
        loop {
            sighup.listen().await;
            info!("SIGHUP received, reloading configuration");
            let reloaded = ltm_config_singleton::settings().as_ref().clone();
            if let Err(e) = ltm_config_singleton::load(&env_config_path, reloaded) {
                error!("config reload failed: {e}");
            }
        }
    });

    frontend::server(port, state).await?;
    Ok(())
}

/// Reads the `ltm-pass` blob once at first boot and derives a salted
/// PBKDF2-HMAC-SHA512 hash from it, per `spec.md` §4.7/§6.
async fn initial_password_hash(storage: &dyn StorageClient) -> (Vec<u8>, Vec<u8>) {
    let password = match storage.download_as_string("ltm-pass").await {
        Ok(p) if !p.trim().is_empty() => p,
        _ => {
            let generated = ltm::util::random_string(32);
            error!("no ltm-pass blob found, generated a random one-time password: {generated}");
            generated
        }
    };
    let rng = SystemRandom::new();
    let mut salt = vec![0u8; 16];
    rng.fill(&mut salt).expect("system RNG failure");
    let mut hash = vec![0u8; 64];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA512,
        NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
        &salt,
        password.trim().as_bytes(),
        &mut hash,
    );
    (hash, salt)
}
