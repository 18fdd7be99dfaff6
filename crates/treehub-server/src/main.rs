use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use treehub_server::{FsBucket, Hub, HubConfig, DEFAULT_WORKERS};

#[derive(Parser)]
#[command(name = "treehub-server", about = "treehub sync hub")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8753)]
    port: u16,

    /// Root directory of the file-backed bucket.
    #[arg(long, default_value = "./treehub-bucket")]
    bucket_dir: PathBuf,

    /// Key prefix bucket objects land under.
    #[arg(long, default_value = "treehub/lmp")]
    object_prefix: String,

    /// Directory for per-request staging areas.
    #[arg(long, default_value = "./treehub-staging")]
    staging_dir: PathBuf,

    /// Worker-pool size shared by bucket checks and uploads.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    fs::create_dir_all(&cli.bucket_dir).expect("failed to create bucket directory");
    fs::create_dir_all(&cli.staging_dir).expect("failed to create staging directory");

    let addr = format!("0.0.0.0:{}", cli.port);
    info!("starting treehub-server on {addr}");
    info!("bucket directory: {}", cli.bucket_dir.display());
    info!("object prefix: {}", cli.object_prefix);

    let hub = Arc::new(Hub::new(
        Arc::new(FsBucket::new(&cli.bucket_dir)),
        HubConfig {
            object_prefix: cli.object_prefix,
            staging_root: cli.staging_dir,
            workers: cli.workers,
        },
    ));
    treehub_server::run_server(&hub, &addr);
}
