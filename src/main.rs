use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use meshgate::certmanager::CertManager;
use meshgate::config::Config;
use meshgate::docker::DockerTargetProvider;
use meshgate::list::ListTargetProvider;
use meshgate::manager::ProxyManager;
use meshgate::tailnet::TailnetProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first; logging verbosity comes from it
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/config/meshgate.yaml"));

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!(
            "failed to load configuration from {}: {}",
            config_path.display(),
            e
        );
        e
    })?;

    init_logging(&config);
    info!(path = %config_path.display(), "Configuration loaded");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting meshgate server"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Proxy manager and providers
    let manager = ProxyManager::new(config.default_proxy_provider.clone());

    for (name, provider_config) in &config.tailscale.providers {
        match TailnetProvider::new(name, provider_config, &config.tailscale.data_dir) {
            Ok(provider) => {
                info!(provider = %name, "Created mesh provider");
                manager.add_mesh_provider(name, Arc::new(provider));
            }
            Err(e) => {
                error!(provider = %name, error = %e, "Error creating mesh provider");
            }
        }
    }

    for (name, provider_config) in &config.docker {
        match DockerTargetProvider::new(name, provider_config).await {
            Ok(provider) => {
                info!(provider = %name, "Created Docker target provider");
                manager.add_target_provider(name, Arc::new(provider));
            }
            Err(e) => {
                error!(provider = %name, error = %e, "Error creating Docker target provider");
            }
        }
    }

    for (name, provider_config) in &config.lists {
        match ListTargetProvider::new(name, provider_config) {
            Ok(provider) => {
                info!(provider = %name, "Created list target provider");
                manager.add_target_provider(name, Arc::new(provider));
            }
            Err(e) => {
                error!(provider = %name, error = %e, "Error creating list target provider");
            }
        }
    }

    // Do not start without providers
    if manager.mesh_provider_count() == 0 {
        error!("No mesh providers configured");
    } else if manager.target_provider_count() == 0 {
        error!("No target providers configured");
    } else {
        manager.watch_events();
    }

    // Front door: health endpoint, TLS when Let's Encrypt is enabled
    spawn_front_door(&config, Arc::clone(&manager), shutdown_rx.clone());

    // Wait for SIGINT/SIGTERM
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down");
    }

    let _ = shutdown_tx.send(true);
    manager.stop_all_proxies().await;
    manager.close_target_providers().await;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone()));

    if config.log.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Serve the management front door. With Let's Encrypt enabled this is TLS
/// with a DNS-01 certificate and a background renewal loop; otherwise plain
/// HTTP.
fn spawn_front_door(
    config: &Config,
    manager: Arc<ProxyManager>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let hostname = config.http.hostname.clone();
    let port = config.http.port;

    if config.lets_encrypt.enabled {
        let lets_encrypt = config.lets_encrypt.clone();
        let renewal_config = lets_encrypt.clone();
        let renewal_shutdown = shutdown_rx.clone();

        tokio::spawn(async move {
            let cert_manager = match CertManager::new(renewal_config) {
                Ok(manager) => manager,
                Err(e) => {
                    error!(error = %e, "Error creating certificate manager");
                    return;
                }
            };
            cert_manager.run_renewal(renewal_shutdown).await;
        });

        tokio::spawn(async move {
            let cert_manager = match CertManager::new(lets_encrypt) {
                Ok(manager) => manager,
                Err(e) => {
                    error!(error = %e, "Error creating certificate manager");
                    return;
                }
            };

            let bind_hostname = hostname.clone();
            let result = cert_manager
                .listen_and_serve_tls(&bind_hostname, port, |listener, tls_config| async move {
                    info!(hostname = %hostname, port, "Front door listening (HTTPS)");
                    let acceptor = TlsAcceptor::from(tls_config);
                    serve_front_door(listener, Some(acceptor), manager, shutdown_rx).await;
                    Ok(())
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, "Error starting TLS front door");
            }
        });
        return;
    }

    tokio::spawn(async move {
        let addr = format!("{}:{}", hostname, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %addr, error = %e, "Error binding front door");
                return;
            }
        };
        info!(addr = %addr, "Front door listening (HTTP)");
        serve_front_door(listener, None, manager, shutdown_rx).await;
    });
}

async fn serve_front_door(
    listener: tokio::net::TcpListener,
    acceptor: Option<TlsAcceptor>,
    manager: Arc<ProxyManager>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Front door accept failed");
                        continue;
                    }
                };

                let manager = Arc::clone(&manager);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let manager = Arc::clone(&manager);
                        async move { handle_front_door(req, manager) }
                    });

                    let builder = AutoBuilder::new(TokioExecutor::new());
                    let result = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                builder
                                    .serve_connection(TokioIo::new(tls_stream), service)
                                    .await
                            }
                            Err(_) => return,
                        },
                        None => builder.serve_connection(TokioIo::new(stream), service).await,
                    };
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "Front door connection error");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn handle_front_door(
    req: hyper::Request<hyper::body::Incoming>,
    manager: Arc<ProxyManager>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/health" => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from("OK")))
            .expect("valid response builder")),
        "/status" => {
            // Iterate over a snapshot of the registry rather than the live
            // map
            let proxies = manager.snapshot();
            let mut lines: Vec<String> = proxies
                .iter()
                .map(|(hostname, proxy)| format!("{} {}", hostname, proxy.status()))
                .collect();
            lines.sort();

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(lines.join("\n"))))
                .expect("valid response builder"))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .expect("valid response builder")),
    }
}
