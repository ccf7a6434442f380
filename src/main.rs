use std::sync::Arc;

use anyhow::Context;
use distribution::client::{ClientConfig, ClientProtocol};
use distribution::secrets::RegistryAuth;
use distribution::{Client, Reference};
use puller::config::Opts;
use puller::download::LocalDownloadManager;
use puller::error::DefaultFallbackPolicy;
use puller::progress::ChannelOutput;
use puller::store::fs::{FileImageStore, FileMetadataStore, FileReferenceStore};
use puller::store::memory::MemoryContentStore;
use puller::{Config, ImagePullConfig, Puller};
use structopt::StructOpt;
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "imgpull",
    about = "Pull a container image from a registry into local storage"
)]
struct Cli {
    #[structopt(flatten)]
    opts: Opts,

    #[structopt(
        short = "a",
        long = "all-tags",
        help = "Pull every tag of the repository when the reference has no tag"
    )]
    all_tags: bool,

    #[structopt(
        long = "username",
        env = "IMGPULL_USERNAME",
        requires = "password",
        help = "Username for basic authentication against the registry"
    )]
    username: Option<String>,

    #[structopt(
        long = "password",
        env = "IMGPULL_PASSWORD",
        hide_env_values = true,
        help = "Password for basic authentication against the registry"
    )]
    password: Option<String>,

    #[structopt(help = "The image to pull, e.g. docker.io/library/busybox:latest")]
    reference: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::from_args();
    let mut reference: Reference = cli
        .reference
        .parse()
        .with_context(|| format!("invalid reference {:?}", cli.reference))?;
    if reference.is_name_only() && !cli.all_tags {
        reference = reference.with_tag("latest")?;
    }

    let config = Config::from_opts(cli.opts)?;
    let auth = match (cli.username, cli.password) {
        (Some(username), Some(password)) => RegistryAuth::Basic(username, password),
        _ => RegistryAuth::Anonymous,
    };
    let client = Client::new(
        ClientConfig {
            protocol: ClientProtocol::HttpsExcept(config.insecure_registries.clone()),
            ..Default::default()
        },
        auth,
    )?;

    let root = config.data_dir.clone();
    tokio::fs::create_dir_all(&root)
        .await
        .with_context(|| format!("unable to create data directory {}", root.display()))?;

    let (progress, mut events) = ChannelOutput::new();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", event);
        }
    });

    let pull_config = ImagePullConfig {
        image_store: Arc::new(FileImageStore::new(&root)),
        reference_store: Arc::new(FileReferenceStore::open(&root).await?),
        download_manager: Arc::new(LocalDownloadManager::new(
            &root,
            config.max_concurrent_downloads,
            config.download_retry.clone(),
        )),
        metadata_store: Some(Arc::new(FileMetadataStore::new(&root))),
        content_store: Some(Arc::new(MemoryContentStore::new())),
        progress: Arc::new(progress),
        fallback_policy: Arc::new(DefaultFallbackPolicy {
            mirror: config.mirror,
        }),
        config,
    };
    let puller = Puller::new(Arc::new(client), pull_config);

    let cancel = CancellationToken::new();
    let signal_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if ctrl_c().await.is_ok() {
                info!("Received interrupt, cancelling pull");
                cancel.cancel();
            }
        })
    };

    let result = puller.pull(&cancel, &reference).await;
    signal_task.abort();
    // Dropping the puller closes the progress channel.
    drop(puller);
    if let Err(e) = printer.await {
        error!(error = %e, "Progress printer failed");
    }

    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("failed to pull {}", reference))),
    }
}
