use crate::config::Config;
use crate::controller::{Controller, EventDispatcher, object_key};
use crate::credentials::{NamespaceCredentials, RegistryAuth};
use crate::gc::ImportCollector;
use crate::leader::{LeaderElectionSettings, LeaderElector};
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::registry::{HttpRegistry, Mirror, Registry, Resolver};
use crate::resources::{BuildRun, FOLLOW_TAGS_LABEL, ImageImport, PENDING_TAGS_LABEL, Tag};
use crate::state::AppState;
use crate::store::{KubeStore, SharedStore};
use crate::syncer::{BuildRunSyncer, DeploymentSyncer, ImageImportSyncer, PodSyncer, TagSyncer};
use crate::transfer::{KubeAuthorizer, Request, TransferClient, TransferServer};
use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use futures::Stream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod admission;
mod bootstrap;
mod config;
mod controller;
mod credentials;
mod error;
mod gc;
mod image_reference;
mod leader;
mod metrics;
mod notify;
mod queue;
mod registry;
mod resources;
mod secret_string;
mod state;
mod store;
mod syncer;
mod transfer;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path of the YAML configuration file
    #[arg(long, env = "TAGGER_CONFIG", default_value = "/etc/kube-tagger/config.yaml")]
    config: PathBuf,
    /// Print the CustomResourceDefinitions and exit
    #[arg(long)]
    print_crds: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download the current image archive of a tag
    Pull {
        #[command(flatten)]
        target: TransferTarget,
        #[arg(long)]
        output: PathBuf,
    },
    /// Upload an image archive as the next generation of a tag
    Push {
        #[command(flatten)]
        target: TransferTarget,
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct TransferTarget {
    /// Address of the transfer server
    #[arg(long, default_value = "localhost:8090")]
    server: String,
    #[arg(long)]
    namespace: String,
    /// Tag name
    #[arg(long)]
    name: String,
    /// Bearer token, usually a service account token
    #[arg(long, env = "TAGGER_TOKEN", hide_env_values = true)]
    token: String,
}

impl TransferTarget {
    fn request(&self) -> Request {
        Request::new(&self.namespace, &self.name, &self.token)
    }
}

async fn transfer(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Pull { target, output } => {
            let client = TransferClient::connect(target.server.as_str()).await?;
            let mut file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let ack = client
                .pull(target.request(), &mut file, |progress| {
                    info!(transferred = progress.transferred, total = progress.total, "Pulling");
                })
                .await?;
            info!(reference = %ack.reference, size = ack.size, "Pulled into {}", output.display());
        }
        Command::Push { target, input } => {
            let client = TransferClient::connect(target.server.as_str()).await?;
            let mut file = tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("Failed to open {}", input.display()))?;
            let ack = client.push(target.request(), &mut file).await?;
            info!(
                reference = %ack.reference,
                generation = ?ack.generation,
                "Pushed {}",
                input.display()
            );
        }
    }
    Ok(())
}

async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

fn watch_all<K>(
    client: &Client,
    config: watcher::Config,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(Api::<K>::all(client.clone()), config).default_backoff()
}

/// Keys of the cached objects living in `namespace`.
fn same_namespace<K: Resource>(cached: Vec<Arc<K>>, namespace: Option<String>) -> Vec<String> {
    cached
        .iter()
        .filter(|obj| obj.meta().namespace == namespace)
        .map(|obj| object_key(&**obj))
        .collect()
}

fn spawn_controller<K>(
    tasks: &TaskTracker,
    metrics: &Metrics,
    controller: Controller<K>,
    leadership: &watch::Receiver<bool>,
    token: &CancellationToken,
) where
    K: Send + Sync + 'static,
{
    let counters = metrics.controller(controller.name(), controller.queue());
    let controller = controller
        .requires_leadership(leadership.clone())
        .with_counters(counters);
    tasks.spawn(controller.start(token.clone()));
}

fn mirror(config: &Config, registry: &Arc<dyn Registry>) -> Option<Mirror> {
    config.mirror.as_ref().map(|m| {
        let auth = match &m.username {
            Some(username) => RegistryAuth::basic(username, m.password.expose_secret()),
            None => RegistryAuth::Anonymous,
        };
        info!(address = %m.address, "Using mirror registry");
        Mirror::new(Arc::clone(registry), &m.address, auth, m.insecure)
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.print_crds {
        print!("{}", resources::crds_yaml()?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    if let Some(command) = args.command {
        return transfer(command).await;
    }
    info!("Starting kube-tagger {}", env!("CARGO_PKG_VERSION"));
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install the rustls crypto provider"))?;

    let config = config::load_config(&args.config)?;
    let client = create_client().await?;
    let token = CancellationToken::new();
    let tasks = TaskTracker::new();

    // Leadership
    let (leader_tx, leader_rx) = watch::channel(false);
    let standalone = if config.leader_election.enabled {
        let election = &config.leader_election;
        let identity = election
            .identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("kube-tagger-{}", std::process::id()));
        let elector = LeaderElector::new(
            client.clone(),
            LeaderElectionSettings {
                lease_name: election.lease_name.clone(),
                namespace: election.namespace.clone(),
                identity,
                lease_duration: Duration::from_secs(election.lease_duration_seconds),
                retry_period: Duration::from_secs(election.retry_period_seconds),
            },
        );
        tasks.spawn(elector.run(leader_tx, token.clone()));
        None
    } else {
        info!("Leader election disabled, running as the only writer");
        leader_tx.send_replace(true);
        Some(leader_tx)
    };

    // Stores and registry access
    let tags: SharedStore<Tag> = KubeStore::<Tag>::shared(client.clone());
    let imports: SharedStore<ImageImport> = KubeStore::<ImageImport>::shared(client.clone());
    let deployments: SharedStore<Deployment> = KubeStore::<Deployment>::shared(client.clone());
    let pods: SharedStore<Pod> = KubeStore::<Pod>::shared(client.clone());
    let secrets: SharedStore<Secret> = KubeStore::<Secret>::shared(client.clone());
    let registry: Arc<dyn Registry> = Arc::new(
        HttpRegistry::new(&config.ca_certificate_paths).context("Failed to create registry client")?,
    );
    let mirror = mirror(&config, &registry);
    let credentials = NamespaceCredentials::new(secrets, mirror.clone());
    let tag_syncer = Arc::new(TagSyncer::new(tags.clone(), imports.clone()));
    let metrics = Metrics::new()
        .context("Failed to register metrics")?
        .with_leadership(leader_rx.clone());

    // Controllers
    let controllers = &config.controllers;
    let tag_controller = Controller::<Tag>::new(
        "tag",
        tags.clone(),
        tag_syncer.clone(),
        controllers.tag.options(),
    );
    let import_controller = Controller::<ImageImport>::new(
        "imageimport",
        imports.clone(),
        Arc::new(ImageImportSyncer::new(
            imports.clone(),
            tags.clone(),
            credentials.clone(),
            Resolver::new(registry.clone()),
            mirror.clone(),
        )),
        controllers.image_import.options(),
    );
    let deployment_controller = Controller::<Deployment>::new(
        "deployment",
        deployments.clone(),
        Arc::new(DeploymentSyncer::new(deployments, tags.clone())),
        controllers.deployment.options(),
    );
    let pod_controller = Controller::<Pod>::new(
        "pod",
        pods.clone(),
        Arc::new(PodSyncer::new(pods, tags.clone())),
        controllers.pod.options(),
    );

    // Tag: own events, and finished imports folding back into their owner
    tasks.spawn(
        EventDispatcher::<Tag>::new(tag_controller.queue())
            .run(watch_all::<Tag>(&client, watcher::Config::default()), token.clone()),
    );
    tasks.spawn(
        EventDispatcher::<ImageImport>::with_mapper(tag_controller.queue(), |import| {
            import
                .owner_image()
                .map(|owner| format!("{}/{}", import.namespace().unwrap_or_default(), owner.name))
                .into_iter()
                .collect()
        })
        .run(watch_all::<ImageImport>(&client, watcher::Config::default()), token.clone()),
    );

    // ImageImport: spec changes only, status writes are retried by the queue
    tasks.spawn(
        EventDispatcher::<ImageImport>::new(import_controller.queue())
            .only_on_generation_change()
            .run(watch_all::<ImageImport>(&client, watcher::Config::default()), token.clone()),
    );

    // Deployment: labelled deployments, and every Tag change in their namespace
    let (followers, followers_writer) = reflector::store::<Deployment>();
    let follow_selector = watcher::Config::default().labels(&format!("{}=true", FOLLOW_TAGS_LABEL));
    tasks.spawn(
        EventDispatcher::<Deployment>::new(deployment_controller.queue()).run(
            watch_all::<Deployment>(&client, follow_selector).reflect(followers_writer),
            token.clone(),
        ),
    );
    tasks.spawn(
        EventDispatcher::<Tag>::with_mapper(deployment_controller.queue(), move |tag| {
            same_namespace(followers.state(), tag.namespace())
        })
        .run(watch_all::<Tag>(&client, watcher::Config::default()), token.clone()),
    );

    // Pod: pending pods, and every Tag change in their namespace
    let (pending, pending_writer) = reflector::store::<Pod>();
    let pending_selector = watcher::Config::default().labels(PENDING_TAGS_LABEL);
    tasks.spawn(
        EventDispatcher::<Pod>::new(pod_controller.queue()).run(
            watch_all::<Pod>(&client, pending_selector).reflect(pending_writer),
            token.clone(),
        ),
    );
    tasks.spawn(
        EventDispatcher::<Tag>::with_mapper(pod_controller.queue(), move |tag| {
            same_namespace(pending.state(), tag.namespace())
        })
        .run(watch_all::<Tag>(&client, watcher::Config::default()), token.clone()),
    );

    spawn_controller(&tasks, &metrics, tag_controller, &leader_rx, &token);
    spawn_controller(&tasks, &metrics, import_controller, &leader_rx, &token);
    spawn_controller(&tasks, &metrics, deployment_controller, &leader_rx, &token);
    spawn_controller(&tasks, &metrics, pod_controller, &leader_rx, &token);

    if controllers.watch_build_runs {
        let buildruns: SharedStore<BuildRun> = KubeStore::<BuildRun>::shared(client.clone());
        let buildrun_controller = Controller::<BuildRun>::new(
            "buildrun",
            buildruns.clone(),
            Arc::new(BuildRunSyncer::new(buildruns, tags.clone())),
            controllers.build_run.options(),
        );
        tasks.spawn(
            EventDispatcher::<BuildRun>::new(buildrun_controller.queue())
                .run(watch_all::<BuildRun>(&client, watcher::Config::default()), token.clone()),
        );
        spawn_controller(&tasks, &metrics, buildrun_controller, &leader_rx, &token);
    }

    let collector = ImportCollector::new(
        imports,
        Duration::from_secs(config.import_gc.grace_seconds),
        Duration::from_secs(config.import_gc.interval_seconds),
    );
    tasks.spawn(collector.run(leader_rx.clone(), token.clone()));

    // Servers run on every replica
    let state = AppState::new(tag_syncer, Notifier::new(tags.clone()), metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {addr}"))?;
    info!("Starting webserver on {}", addr);
    let app = webserver::create_app(state.clone());
    let shutdown = token.clone().cancelled_owned();
    tasks.spawn(async move {
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "Webserver failed");
        }
    });

    let admission = &config.admission;
    let tls = bootstrap::ensure_tls_secret(
        client.clone(),
        &admission.namespace,
        &admission.tls_secret,
        bootstrap::service_dns_names(&admission.service, &admission.namespace),
    )
    .await?;
    if let Some(configuration) = &admission.webhook_configuration {
        bootstrap::inject_ca_bundle(client.clone(), configuration, &tls.cert_pem).await?;
    }
    let rustls_config = tls.rustls_config().await?;
    let handle = axum_server::Handle::new();
    tasks.spawn({
        let handle = handle.clone();
        let token = token.clone();
        async move {
            token.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], admission.port));
    info!("Starting admission webhooks on {}", addr);
    let app = webserver::create_admission_app(state);
    tasks.spawn(async move {
        if let Err(e) = axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
        {
            error!(error = %e, "Admission server failed");
        }
    });

    let transfer = Arc::new(
        TransferServer::new(
            Arc::new(KubeAuthorizer::new(client.clone())),
            tags,
            credentials,
            registry,
            mirror,
        )
        .with_keepalive(config.transfer.keepalive()),
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], config.transfer.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind transfer server to {addr}"))?;
    info!("Starting transfer server on {}", addr);
    tasks.spawn(transfer.serve(listener, token.clone()));

    shutdown_signal().await;
    info!("Shutting down");
    token.cancel();
    tasks.close();
    tasks.wait().await;
    drop(standalone);
    info!("Stopped");
    Ok(())
}
