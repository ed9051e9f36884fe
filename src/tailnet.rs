//! Tailscale-style mesh provider
//!
//! Realizes the mesh contract against a tailnet control plane: nodes are
//! registered with an auth key, join state is watched and translated into
//! endpoint events, and per-node TLS material is fetched once the node is
//! running. Auth keys come from the proxy config, from an OAuth-minted key
//! cached on disk, or from the provider's preshared key, in that order.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::TailscaleServerConfig;
use crate::error::Error;
use crate::files;
use crate::mesh::{EndpointEvent, EndpointStatus, MeshEndpoint, MeshListener, MeshProvider};
use crate::model::{Identity, PortConfig, Protocol, ProxyConfig};

/// API host used to mint auth keys from OAuth credentials
const DEFAULT_API_URL: &str = "https://api.tailscale.com";

/// Cadence of join-state polling
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Minted OAuth key cached across restarts
#[derive(Debug, Default, Deserialize, Serialize)]
struct CachedAuthKey {
    authkey: String,
}

pub struct TailnetProvider {
    name: String,
    config: TailscaleServerConfig,
    data_dir: PathBuf,
    http: reqwest::Client,
}

impl TailnetProvider {
    pub fn new(name: &str, config: &TailscaleServerConfig, data_dir: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            data_dir: Path::new(data_dir).join(name),
            http,
        })
    }

    /// Resolve the auth key for one node: the proxy's inline key, an
    /// OAuth-minted key (cached to disk), then the provider's preshared key
    async fn auth_key_for(&self, config: &ProxyConfig, node_dir: &Path) -> String {
        let mut auth_key = config.tailscale.auth_key.trim().to_string();

        if !self.config.client_id.is_empty() && !self.config.client_secret.is_empty() {
            auth_key = self.mint_auth_key(config, node_dir).await;
        }

        if auth_key.is_empty() {
            auth_key = self.config.auth_key.trim().to_string();
        }
        auth_key
    }

    /// Mint an auth key from OAuth credentials, reusing a cached key when
    /// one survives from an earlier run. Requires tags.
    async fn mint_auth_key(&self, config: &ProxyConfig, node_dir: &Path) -> String {
        let cache_path = node_dir.join("authkey.yaml");
        if let Ok(cached) = files::load_yaml::<CachedAuthKey>(&cache_path) {
            if !cached.authkey.is_empty() {
                return cached.authkey;
            }
        }

        let mut tags = config.tailscale.tags.trim().trim_matches('"').to_string();
        if tags.is_empty() {
            tags = self.config.tags.trim().trim_matches('"').to_string();
        }
        if tags.is_empty() {
            error!(provider = %self.name, "must define tags to use OAuth");
            return String::new();
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let token: TokenResponse = match self
            .http
            .post(format!("{}/api/v2/oauth/token", DEFAULT_API_URL))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json().await {
                Ok(token) => token,
                Err(e) => {
                    error!(provider = %self.name, error = %e, "unable to parse OAuth token");
                    return String::new();
                }
            },
            Err(e) => {
                error!(provider = %self.name, error = %e, "unable to get OAuth token");
                return String::new();
            }
        };

        let request = serde_json::json!({
            "description": "meshgate",
            "capabilities": {
                "devices": {
                    "create": {
                        "reusable": false,
                        "ephemeral": config.tailscale.ephemeral,
                        "preauthorized": true,
                        "tags": tags.split(',').map(str::trim).collect::<Vec<_>>(),
                    }
                }
            }
        });

        #[derive(Deserialize)]
        struct KeyResponse {
            key: String,
        }

        let key: KeyResponse = match self
            .http
            .post(format!("{}/api/v2/tailnet/-/keys", DEFAULT_API_URL))
            .bearer_auth(&token.access_token)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json().await {
                Ok(key) => key,
                Err(e) => {
                    error!(provider = %self.name, error = %e, "unable to parse minted key");
                    return String::new();
                }
            },
            Err(e) => {
                error!(provider = %self.name, error = %e, "unable to mint auth key");
                return String::new();
            }
        };

        let cached = CachedAuthKey {
            authkey: key.key.clone(),
        };
        if let Err(e) = files::save_yaml(&cache_path, &cached) {
            error!(provider = %self.name, error = %e, "unable to save minted key");
        }

        key.key
    }
}

#[async_trait]
impl MeshProvider for TailnetProvider {
    async fn new_endpoint(&self, config: &ProxyConfig) -> anyhow::Result<Box<dyn MeshEndpoint>> {
        debug!(provider = %self.name, hostname = %config.hostname, "Setting up tailnet node");

        let node_dir = self.data_dir.join(&config.hostname);
        let auth_key = self.auth_key_for(config, &node_dir).await;

        let (events_tx, events_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Box::new(TailnetNode {
            shared: Arc::new(NodeShared {
                hostname: config.hostname.clone(),
                config: config.clone(),
                control: ControlClient {
                    http: self.http.clone(),
                    control_url: self.config.control_url.trim_end_matches('/').to_string(),
                },
                auth_key,
                node_dir,
                machine_id: Mutex::new(None),
                state: Mutex::new(NodeState::default()),
                events_tx,
            }),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
        }))
    }
}

#[derive(Debug, Default)]
struct NodeState {
    status: Option<EndpointStatus>,
    url: Option<String>,
    auth_url: Option<String>,
    dns_name: Option<String>,
}

/// One node on the mesh, 1:1 with a proxy
pub struct TailnetNode {
    shared: Arc<NodeShared>,
    events_rx: Mutex<Option<mpsc::Receiver<EndpointEvent>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Node state shared with the status-poll task
struct NodeShared {
    hostname: String,
    config: ProxyConfig,
    control: ControlClient,
    auth_key: String,
    node_dir: PathBuf,
    machine_id: Mutex<Option<String>>,
    state: Mutex<NodeState>,
    events_tx: mpsc::Sender<EndpointEvent>,
}

impl NodeShared {
    /// Record a join-state transition and emit it; repeats are suppressed
    async fn set_status(
        &self,
        status: EndpointStatus,
        dns_name: Option<String>,
        auth_url: Option<String>,
    ) {
        {
            let mut state = self.state.lock();
            if state.status == Some(status) {
                return;
            }

            state.status = Some(status);
            if let Some(dns_name) = &dns_name {
                state.url = Some(format!("https://{}", dns_name));
                state.dns_name = Some(dns_name.clone());
            }
            if let Some(auth_url) = &auth_url {
                state.auth_url = Some(auth_url.clone());
            }
        }

        debug!(node = %self.hostname, status = ?status, "tailnet status");

        let _ = self
            .events_tx
            .send(EndpointEvent {
                status,
                auth_url,
                dns_name,
            })
            .await;
    }

    async fn apply_node_status(&self, status: NodeStatus) {
        match status.state.as_str() {
            "needs_login" => {
                if let Some(auth_url) = status.auth_url {
                    self.set_status(EndpointStatus::NeedsLogin, None, Some(auth_url))
                        .await;
                }
            }
            "starting" => {
                self.set_status(EndpointStatus::Starting, None, None).await;
            }
            "running" => {
                let dns_name = status
                    .dns_name
                    .map(|d| d.trim_end_matches('.').to_string());
                self.set_status(EndpointStatus::Running, dns_name, None)
                    .await;
            }
            other => {
                debug!(node = %self.hostname, state = %other, "unhandled node state");
            }
        }
    }

    /// Load cached TLS material, fetching it from the control plane on a
    /// cache miss
    async fn node_certificate(&self) -> anyhow::Result<TlsAcceptor> {
        let domain = self
            .state
            .lock()
            .dns_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("node has no DNS name yet"))?;

        let cert_path = self.node_dir.join(format!("{}.crt", domain));
        let key_path = self.node_dir.join(format!("{}.key", domain));

        if !cert_path.exists() || !key_path.exists() {
            self.fetch_certificate(&domain, &cert_path, &key_path)
                .await?;
        }

        let certs = load_certs(&cert_path)?;
        let key = load_key(&key_path)?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    async fn fetch_certificate(
        &self,
        domain: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> anyhow::Result<()> {
        let machine_id = self
            .machine_id
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("node not registered"))?;

        info!(node = %self.hostname, domain, "Requesting node TLS certificate");
        let pair = self.control.cert_pair(&machine_id, domain).await?;

        std::fs::create_dir_all(&self.node_dir)?;
        std::fs::write(cert_path, pair.cert_pem)?;
        write_key_restricted(key_path, &pair.key_pem)?;

        Ok(())
    }
}

#[async_trait]
impl MeshEndpoint for TailnetNode {
    async fn start(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.shared.node_dir)?;

        let registration = self
            .shared
            .control
            .register(RegisterRequest {
                hostname: self.shared.hostname.clone(),
                auth_key: self.shared.auth_key.clone(),
                ephemeral: self.shared.config.tailscale.ephemeral,
                tags: self
                    .shared
                    .config
                    .tailscale
                    .tags
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
            .await?;

        *self.shared.machine_id.lock() = Some(registration.machine_id.clone());
        self.shared.apply_node_status(registration.status).await;

        // Poll the control plane and translate join-state transitions until
        // the node is closed
        let shared = Arc::clone(&self.shared);
        let machine_id = registration.machine_id;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            // A close that raced this subscription won't trigger changed()
            if *shutdown_rx.borrow() {
                return;
            }
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {
                        match shared.control.status(&machine_id).await {
                            Ok(status) => shared.apply_node_status(status).await,
                            Err(e) => {
                                debug!(node = %shared.hostname, error = %e, "node status poll failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);

        let machine_id = self.shared.machine_id.lock().clone();
        if let Some(machine_id) = machine_id {
            if let Err(e) = self.shared.control.unregister(&machine_id).await {
                warn!(node = %self.shared.hostname, error = %e, "node unregister failed");
            }
        }
        Ok(())
    }

    async fn listener(&self, port_key: &str) -> anyhow::Result<MeshListener> {
        let port: PortConfig = self
            .shared
            .config
            .ports
            .get(port_key)
            .cloned()
            .ok_or_else(|| Error::ProxyPortNotFound(port_key.to_string()))?;

        let addr: SocketAddr = format!("0.0.0.0:{}", port.proxy_port).parse()?;
        let listener = TcpListener::bind(addr).await?;

        if port.tailscale.funnel {
            // Funnel exposure is flipped on at the control plane; traffic
            // still arrives on the same listener
            let machine_id = self.shared.machine_id.lock().clone();
            if let Some(machine_id) = machine_id {
                self.shared
                    .control
                    .enable_funnel(&machine_id, port.proxy_port)
                    .await?;
            }
            return Ok(MeshListener::Plain(listener));
        }

        if port.proxy_protocol == Protocol::Https {
            let acceptor = self.shared.node_certificate().await?;
            return Ok(MeshListener::Tls { listener, acceptor });
        }

        Ok(MeshListener::Plain(listener))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<EndpointEvent>> {
        self.events_rx.lock().take()
    }

    fn url(&self) -> Option<String> {
        self.shared.state.lock().url.clone()
    }

    fn auth_url(&self) -> Option<String> {
        self.shared.state.lock().auth_url.clone()
    }

    async fn whois(&self, remote: SocketAddr) -> Identity {
        let machine_id = match self.shared.machine_id.lock().clone() {
            Some(machine_id) => machine_id,
            None => return Identity::default(),
        };

        match self.shared.control.whois(&machine_id, remote).await {
            Ok(who) => Identity {
                username: who.login_name,
                display_name: who.display_name,
                profile_pic_url: who.profile_pic_url,
            },
            Err(_) => Identity::default(),
        }
    }

    async fn prefetch_tls_certificates(&self) {
        let has_tls_port = self
            .shared
            .config
            .ports
            .values()
            .any(|p| p.proxy_protocol == Protocol::Https);
        if !has_tls_port {
            return;
        }

        info!(node = %self.shared.hostname, "Prefetching TLS certificate");
        if let Err(e) = self.shared.node_certificate().await {
            error!(node = %self.shared.hostname, error = %e, "error prefetching TLS certificate");
        }
    }
}

/// Typed client for the control-plane HTTP API
#[derive(Clone)]
struct ControlClient {
    http: reqwest::Client,
    control_url: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest {
    hostname: String,
    auth_key: String,
    ephemeral: bool,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    machine_id: String,
    #[serde(flatten)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct NodeStatus {
    state: String,
    #[serde(default)]
    auth_url: Option<String>,
    #[serde(default)]
    dns_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhoisResponse {
    #[serde(default)]
    login_name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    profile_pic_url: String,
}

#[derive(Debug, Deserialize)]
struct CertPairResponse {
    cert_pem: String,
    key_pem: String,
}

impl ControlClient {
    async fn register(&self, request: RegisterRequest) -> anyhow::Result<RegisterResponse> {
        let response = self
            .http
            .post(format!("{}/machine/register", self.control_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn status(&self, machine_id: &str) -> anyhow::Result<NodeStatus> {
        let response = self
            .http
            .get(format!("{}/machine/{}/status", self.control_url, machine_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn whois(&self, machine_id: &str, remote: SocketAddr) -> anyhow::Result<WhoisResponse> {
        let response = self
            .http
            .get(format!("{}/machine/{}/whois", self.control_url, machine_id))
            .query(&[("addr", remote.to_string())])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn cert_pair(&self, machine_id: &str, domain: &str) -> anyhow::Result<CertPairResponse> {
        let response = self
            .http
            .post(format!("{}/machine/{}/cert", self.control_url, machine_id))
            .json(&serde_json::json!({ "domain": domain }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn enable_funnel(&self, machine_id: &str, port: u16) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/machine/{}/funnel", self.control_url, machine_id))
            .json(&serde_json::json!({ "port": port }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn unregister(&self, machine_id: &str) -> anyhow::Result<()> {
        self.http
            .delete(format!("{}/machine/{}", self.control_url, machine_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let data = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(&data[..]))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            anyhow::anyhow!("failed to parse certificates from {}: {}", path.display(), e)
        })?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let data = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut std::io::BufReader::new(&data[..]))
        .map_err(|e| anyhow::anyhow!("failed to parse key from {}: {}", path.display(), e))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Write a private key with owner-only permissions
fn write_key_restricted(path: &Path, key_pem: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(key_pem.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, key_pem)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_auth_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authkey.yaml");

        let cached = CachedAuthKey {
            authkey: "tskey-minted".into(),
        };
        files::save_yaml(&path, &cached).unwrap();

        let loaded: CachedAuthKey = files::load_yaml(&path).unwrap();
        assert_eq!(loaded.authkey, "tskey-minted");
    }

    #[test]
    fn test_node_status_parsing() {
        let status: NodeStatus = serde_json::from_str(
            r#"{"state":"needs_login","auth_url":"https://login.tailscale.com/a/1"}"#,
        )
        .unwrap();
        assert_eq!(status.state, "needs_login");
        assert_eq!(
            status.auth_url.as_deref(),
            Some("https://login.tailscale.com/a/1")
        );

        let status: NodeStatus =
            serde_json::from_str(r#"{"state":"running","dns_name":"web.example.ts.net."}"#)
                .unwrap();
        assert_eq!(status.dns_name.as_deref(), Some("web.example.ts.net."));
    }

    #[test]
    fn test_register_response_flattens_status() {
        let response: RegisterResponse =
            serde_json::from_str(r#"{"machine_id":"m-1","state":"starting"}"#).unwrap();
        assert_eq!(response.machine_id, "m-1");
        assert_eq!(response.status.state, "starting");
    }

    #[tokio::test]
    async fn test_auth_key_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider_config = TailscaleServerConfig {
            auth_key: "tskey-preshared".into(),
            control_url: "https://control.example.com".into(),
            ..Default::default()
        };
        let provider =
            TailnetProvider::new("default", &provider_config, dir.path().to_str().unwrap())
                .unwrap();

        // Inline key wins over the preshared key
        let mut config = ProxyConfig::new("t1".into(), "web".into(), "docker".into());
        config.tailscale.auth_key = "tskey-inline".into();
        let key = provider.auth_key_for(&config, dir.path()).await;
        assert_eq!(key, "tskey-inline");

        // Without an inline key the preshared key is used
        config.tailscale.auth_key = String::new();
        let key = provider.auth_key_for(&config, dir.path()).await;
        assert_eq!(key, "tskey-preshared");
    }

    #[tokio::test]
    async fn test_minted_key_cache_short_circuits_oauth() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("node");
        std::fs::create_dir_all(&node_dir).unwrap();
        files::save_yaml(
            &node_dir.join("authkey.yaml"),
            &CachedAuthKey {
                authkey: "tskey-cached".into(),
            },
        )
        .unwrap();

        let provider_config = TailscaleServerConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            tags: "tag:web".into(),
            control_url: "https://control.example.com".into(),
            ..Default::default()
        };
        let provider =
            TailnetProvider::new("default", &provider_config, dir.path().to_str().unwrap())
                .unwrap();

        let config = ProxyConfig::new("t1".into(), "web".into(), "docker".into());
        // No HTTP call happens: the cached key is returned directly
        let key = provider.mint_auth_key(&config, &node_dir).await;
        assert_eq!(key, "tskey-cached");
    }

    #[tokio::test]
    async fn test_listener_unknown_port_key() {
        let config = ProxyConfig::new("t1".into(), "web".into(), "docker".into());
        let (events_tx, events_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = watch::channel(false);

        let node = TailnetNode {
            shared: Arc::new(NodeShared {
                hostname: "web".into(),
                config,
                control: ControlClient {
                    http: reqwest::Client::new(),
                    control_url: "https://control.example.com".into(),
                },
                auth_key: String::new(),
                node_dir: PathBuf::from("/tmp/meshgate-test"),
                machine_id: Mutex::new(None),
                state: Mutex::new(NodeState::default()),
                events_tx,
            }),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
        };

        let result = node.listener("443/https").await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("proxy port not found"));
    }
}
