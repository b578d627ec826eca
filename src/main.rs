mod cluster;
mod config;
mod dynakube;
mod error;
mod events;
mod handlers;
mod health;
mod injector;
mod metrics;
mod mutation;
mod owner;
mod patch;
#[cfg(test)]
mod testing;
mod tls;
mod validation;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::cluster::{Cluster, KubeCluster};
use crate::config::InjectorConfig;
use crate::events::KubeEventPublisher;
use crate::injector::PodInjector;
use crate::mutation::PodMutator;
use crate::mutation::dataingest::DataIngestMutator;
use crate::mutation::oneagent::OneAgentMutator;
use crate::mutation::pipeline::MutationPipeline;

const EVENT_REPORTER: &str = "dynatrace-webhook";

#[derive(Parser)]
#[command(name = "dynakube-webhook", about = "Injects the Dynatrace OneAgent into pods")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/dynatrace/webhook.yaml", env = "INJECTOR_CONFIG")]
    config: String,
}

fn exit_with(message: String) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler, waiting for CTRL+C only: {e}");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_https_server(
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    router: Router,
    ready: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    ready.store(true, Ordering::Relaxed);

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    error!("failed to accept TCP connection: {e}");
                    continue;
                }
            },
            _ = shutdown_rx.changed() => {
                info!("webhook server shutting down");
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());
            if let Err(e) = HttpBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }
}

async fn run_http_server(listener: TcpListener, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("metrics server shutting down");
        })
        .await
    {
        error!("metrics server error: {e}");
    }
}

async fn bind(addr: &str, what: &str) -> TcpListener {
    let addr: SocketAddr = addr
        .parse()
        .unwrap_or_else(|e| exit_with(format!("Invalid {what} address '{addr}': {e}")));
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| exit_with(format!("Failed to bind {what} on {addr}: {e}")));
    info!(%addr, "{what} server listening");
    listener
}

/// Fills in the installer image and cluster id when the config leaves them
/// out. Both are required, so failing to discover either is fatal.
async fn discover(config: &InjectorConfig, cluster: &KubeCluster) -> (String, String) {
    let image = match &config.image {
        Some(image) => image.clone(),
        None => {
            let pod_name = config.pod_name.as_deref().unwrap_or_else(|| {
                exit_with("No installer image configured and no webhook pod name to discover it from".to_string())
            });
            match cluster.pod_image(pod_name, &config.namespace).await {
                Ok(Some(image)) => image,
                Ok(None) => exit_with(format!("Webhook pod '{pod_name}' has no container image")),
                Err(e) => exit_with(format!("Failed to read webhook pod '{pod_name}': {e}")),
            }
        }
    };

    let cluster_id = match &config.cluster_id {
        Some(id) => id.clone(),
        None => match cluster.cluster_uid().await {
            Ok(Some(uid)) => uid,
            Ok(None) => exit_with("Namespace kube-system has no UID".to_string()),
            Err(e) => exit_with(format!("Failed to determine the cluster id: {e}")),
        },
    };

    (image, cluster_id)
}

#[tokio::main]
async fn main() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        exit_with("Failed to install the default rustls CryptoProvider".to_string());
    }

    let cli = Cli::parse();

    let config = InjectorConfig::load(&cli.config)
        .unwrap_or_else(|e| exit_with(format!("Failed to load config from {}: {e}", cli.config)));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        namespace = %config.namespace,
        request_timeout_secs = config.request_timeout_secs,
        admission_timeout_secs = config.admission_timeout_secs,
        "dynakube-webhook starting"
    );

    let tls_config = tls::load_tls_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| exit_with(format!("Failed to load TLS config: {e}")));
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let client = kube::Client::try_default()
        .await
        .unwrap_or_else(|e| exit_with(format!("Failed to create Kubernetes client: {e}")));
    let kube_cluster = KubeCluster::new(client.clone(), config.request_timeout());
    let (image, cluster_id) = discover(&config, &kube_cluster).await;
    info!(%image, %cluster_id, "resolved installer image and cluster id");

    let cluster: Arc<dyn Cluster> = Arc::new(kube_cluster);
    let mutators: Vec<Arc<dyn PodMutator>> = vec![
        Arc::new(OneAgentMutator::new(cluster.clone(), cluster_id.clone())),
        Arc::new(DataIngestMutator::new(cluster.clone(), cluster_id)),
    ];
    let pipeline = MutationPipeline::new(mutators)
        .unwrap_or_else(|e| exit_with(format!("Invalid mutator set: {e}")));

    let mut registry = Registry::default();
    let injector_metrics = metrics::InjectorMetrics::new(&mut registry, pipeline.mutators());
    let registry = Arc::new(registry);

    let injector = PodInjector::new(
        cluster.clone(),
        Arc::new(KubeEventPublisher::new(client, EVENT_REPORTER)),
        pipeline,
        image,
        config.namespace.clone(),
        config.admission_timeout(),
    );

    let app_state = Arc::new(handlers::AppState {
        injector: Arc::new(injector),
        cluster,
        metrics: injector_metrics,
    });

    let webhook_router = Router::new()
        .route("/inject", post(handlers::handle_inject))
        .route("/validate", post(handlers::handle_validate))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let ready = Arc::new(AtomicBool::new(false));
    let metrics_router = health::router(Arc::new(health::HealthState {
        registry,
        ready: ready.clone(),
    }));

    let webhook_listener = bind(&config.listen_addr, "webhook").await;
    let metrics_listener = bind(&config.metrics_addr, "metrics").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_https_server(webhook_listener, tls_acceptor, webhook_router, ready, shutdown_rx.clone()),
        run_http_server(metrics_listener, metrics_router, shutdown_rx),
    );

    info!("dynakube-webhook shut down gracefully");
}
