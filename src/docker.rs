//! Container-runtime target provider
//!
//! Discovers targets via the container engine's list and event APIs,
//! filtered to containers carrying the enable label, and materializes proxy
//! configs from container labels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, Service};
use bollard::network::ListNetworksOptions;
use bollard::service::InspectServiceOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::DockerProviderConfig;
use crate::error::Error;
use crate::model::{
    self, parse_long_port_spec, Dashboard, PortConfig, ProxyConfig, TailscaleParams, UpstreamSpec,
};
use crate::target::{TargetAction, TargetEvent, TargetProvider};

/// A container is discovered when it carries `meshgate.enable=true`
const LABEL_IS_ENABLED: &str = "meshgate.enable=true";
const LABEL_NAME: &str = "meshgate.name";
const LABEL_PORT_PREFIX: &str = "meshgate.port.";
const LABEL_CONTAINER_PORT: &str = "meshgate.container_port";
const LABEL_SCHEME: &str = "meshgate.scheme";
const LABEL_TLS_VALIDATE: &str = "meshgate.tls_validate";
const LABEL_FUNNEL: &str = "meshgate.funnel";
const LABEL_AUTHKEY: &str = "meshgate.authkey";
const LABEL_AUTHKEY_FILE: &str = "meshgate.authkeyfile";
const LABEL_TAGS: &str = "meshgate.tags";
const LABEL_EPHEMERAL: &str = "meshgate.ephemeral";
const LABEL_RUN_WEB_CLIENT: &str = "meshgate.runwebclient";
const LABEL_TSNET_VERBOSE: &str = "meshgate.tsnet_verbose";
const LABEL_AUTODETECT: &str = "meshgate.autodetect";
const LABEL_PROXY_PROVIDER: &str = "meshgate.proxy_provider";
const LABEL_CONTAINER_ACCESS_LOG: &str = "meshgate.container_access_log";
const LABEL_DASHBOARD_VISIBLE: &str = "meshgate.dashboard_visible";
const LABEL_DASHBOARD_LABEL: &str = "meshgate.dashboard_label";
const LABEL_DASHBOARD_ICON: &str = "meshgate.dashboard_icon";

const SWARM_SERVICE_ID_LABEL: &str = "com.docker.swarm.service.id";

/// Autodetect probing: rounds and pause between rounds
const AUTODETECT_TRIES: usize = 3;
const AUTODETECT_SLEEP: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Truthy label values, case-insensitive
pub fn parse_bool_label(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Probes candidate upstream addresses during autodetect. Injectable so
/// tests control time and reachability.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: &str, port: u16) -> bool;
    async fn sleep(&self);
}

/// Real prober: TCP connect with a short timeout
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: &str, port: u16) -> bool {
        let target = format!("{}:{}", addr, port);
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&target)).await,
            Ok(Ok(_))
        )
    }

    async fn sleep(&self) {
        tokio::time::sleep(AUTODETECT_SLEEP).await;
    }
}

/// Docker-backed target provider
pub struct DockerTargetProvider {
    docker: Docker,
    name: String,
    config: DockerProviderConfig,
    default_bridge_address: String,
    containers: Mutex<HashSet<String>>,
    events_tx: Mutex<Option<mpsc::Sender<TargetEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    prober: Arc<dyn Prober>,
}

impl DockerTargetProvider {
    pub async fn new(name: &str, config: &DockerProviderConfig) -> anyhow::Result<Self> {
        let docker = connect(&config.host)?;

        let (shutdown_tx, _) = watch::channel(false);
        let mut provider = Self {
            docker,
            name: name.to_string(),
            config: config.clone(),
            default_bridge_address: String::new(),
            containers: Mutex::new(HashSet::new()),
            events_tx: Mutex::new(None),
            shutdown_tx,
            prober: Arc::new(TcpProber),
        };
        provider.default_bridge_address = provider.find_default_bridge_address().await;

        Ok(provider)
    }

    /// Gateway of the engine's default bridge network, when one exists
    async fn find_default_bridge_address(&self) -> String {
        let networks = match self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
        {
            Ok(networks) => networks,
            Err(e) => {
                error!(provider = %self.name, error = %e, "Error listing Docker networks");
                return String::new();
            }
        };

        for network in networks {
            let is_default = network
                .options
                .as_ref()
                .and_then(|o| o.get("com.docker.network.bridge.default_bridge"))
                .map(|v| v == "true")
                .unwrap_or(false);
            if !is_default {
                continue;
            }

            if let Some(gateway) = network
                .ipam
                .as_ref()
                .and_then(|ipam| ipam.config.as_ref())
                .and_then(|configs| configs.first())
                .and_then(|c| c.gateway.as_deref())
            {
                info!(provider = %self.name, gateway, "Default bridge network found");
                return gateway.trim().to_string();
            }
        }

        String::new()
    }

    fn stop_event(&self, id: String) -> TargetEvent {
        info!(provider = %self.name, container = %id, "Container stopped");
        TargetEvent {
            id,
            action: TargetAction::Stop,
            provider: self.name.clone(),
        }
    }

    /// Emit a Start for every enabled container currently running. Runs on
    /// its own task so startup emission cannot block the caller.
    fn emit_existing_containers(
        &self,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<anyhow::Error>,
    ) {
        let docker = self.docker.clone();
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("label".to_string(), vec![LABEL_IS_ENABLED.to_string()]);

            let containers = match docker
                .list_containers(Some(ListContainersOptions {
                    all: false,
                    filters,
                    ..Default::default()
                }))
                .await
            {
                Ok(containers) => containers,
                Err(e) => {
                    let _ = errors
                        .send(anyhow::anyhow!("error listing containers: {}", e))
                        .await;
                    return;
                }
            };

            for container in containers {
                if let Some(id) = container.id {
                    info!(provider = %provider_name, container = %id, "Container started");
                    let _ = events
                        .send(TargetEvent {
                            id,
                            action: TargetAction::Start,
                            provider: provider_name.clone(),
                        })
                        .await;
                }
            }
        });
    }
}

fn connect(host: &str) -> anyhow::Result<Docker> {
    if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("cannot connect to Unix socket '{}': {}", path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "invalid docker host '{}': expected 'unix:///path' or 'tcp://host:port'",
            host
        )
    }
}

#[async_trait]
impl TargetProvider for DockerTargetProvider {
    async fn watch_events(
        &self,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<anyhow::Error>,
    ) {
        *self.events_tx.lock() = Some(events.clone());

        // Start/die events on enable-labeled containers only
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![LABEL_IS_ENABLED.to_string()]);
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "die".to_string()],
        );

        let docker = self.docker.clone();
        let provider_name = self.name.clone();
        let events_clone = events.clone();
        let errors_clone = errors.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            // A close that raced this subscription won't trigger changed()
            if *shutdown_rx.borrow() {
                return;
            }
            let mut stream = docker.events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }));

            loop {
                tokio::select! {
                    message = stream.next() => {
                        match message {
                            Some(Ok(event)) => {
                                let id = match event.actor.and_then(|a| a.id) {
                                    Some(id) => id,
                                    None => continue,
                                };
                                let action = match event.action.as_deref() {
                                    Some("start") => TargetAction::Start,
                                    Some("die") => TargetAction::Stop,
                                    _ => continue,
                                };
                                let _ = events_clone
                                    .send(TargetEvent {
                                        id,
                                        action,
                                        provider: provider_name.clone(),
                                    })
                                    .await;
                            }
                            Some(Err(e)) => {
                                // Event stream failures are terminal for the watcher
                                let _ = errors_clone
                                    .send(anyhow::anyhow!("docker event stream: {}", e))
                                    .await;
                                return;
                            }
                            None => {
                                let _ = errors_clone
                                    .send(anyhow::anyhow!("docker event stream closed"))
                                    .await;
                                return;
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

        self.emit_existing_containers(events, errors);
    }

    async fn add_target(&self, id: &str) -> anyhow::Result<ProxyConfig> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("error inspecting container: {}", e))?;

        // Swarm-managed containers publish ports on the service, not the task
        let service = match inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(SWARM_SERVICE_ID_LABEL))
        {
            Some(service_id) => self
                .docker
                .inspect_service(service_id, None::<InspectServiceOptions>)
                .await
                .ok(),
            None => None,
        };

        let info = ContainerInfo::from_inspect(&inspect, service.as_ref(), &self.config);
        let config = info
            .into_proxy_config(
                &self.name,
                &self.config,
                &self.default_bridge_address,
                self.prober.as_ref(),
            )
            .await?;

        self.containers.lock().insert(id.to_string());
        Ok(config)
    }

    async fn delete_proxy(&self, id: &str) -> anyhow::Result<()> {
        if !self.containers.lock().remove(id) {
            return Err(Error::TargetNotFound(id.to_string()).into());
        }
        Ok(())
    }

    fn default_proxy_provider_name(&self) -> String {
        self.config.default_proxy_provider.clone()
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(true);

        let active: Vec<String> = self.containers.lock().iter().cloned().collect();
        let events = self.events_tx.lock().clone();
        if let Some(events) = events {
            for id in active {
                let _ = events.send(self.stop_event(id)).await;
            }
        }
    }
}

/// Everything read off one inspected container, decoupled from the runtime
/// client so materialization is testable
struct ContainerInfo {
    id: String,
    name: String,
    image: String,
    labels: HashMap<String, String>,
    network_mode: String,
    /// internal port -> published host port
    ports: HashMap<u16, u16>,
    ip_addresses: Vec<String>,
    gateways: Vec<String>,
    autodetect: bool,
}

impl ContainerInfo {
    fn from_inspect(
        inspect: &ContainerInspectResponse,
        service: Option<&Service>,
        provider: &DockerProviderConfig,
    ) -> Self {
        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let network_mode = inspect
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.clone())
            .unwrap_or_default();

        let mut ports = HashMap::new();
        if network_mode == "host" {
            // Host networking: the internal port is reachable as-is
            if let Some(bindings) = inspect.host_config.as_ref().and_then(|h| h.port_bindings.as_ref()) {
                for key in bindings.keys() {
                    if let Some(port) = parse_port_key(key) {
                        ports.insert(port, port);
                    }
                }
            }
        } else if let Some(port_map) = inspect.network_settings.as_ref().and_then(|n| n.ports.as_ref()) {
            for (key, bindings) in port_map {
                let internal = match parse_port_key(key) {
                    Some(port) => port,
                    None => continue,
                };
                let published = bindings
                    .as_ref()
                    .and_then(|b| b.first())
                    .and_then(|b| b.host_port.as_deref())
                    .and_then(|p| p.parse::<u16>().ok());
                if let Some(published) = published {
                    ports.insert(internal, published);
                }
            }
        }

        // Ports published on the swarm service supplement the container's own
        if let Some(endpoint_ports) = service
            .and_then(|s| s.endpoint.as_ref())
            .and_then(|e| e.ports.as_ref())
        {
            for port in endpoint_ports {
                let (target, published) = match (port.target_port, port.published_port) {
                    (Some(t), Some(p)) => (t as u16, p as u16),
                    _ => continue,
                };
                ports.entry(target).or_insert(published);
            }
        }

        let mut ip_addresses = Vec::new();
        let mut gateways = Vec::new();
        if let Some(networks) = inspect.network_settings.as_ref().and_then(|n| n.networks.as_ref()) {
            for network in networks.values() {
                if let Some(ip) = network.ip_address.as_deref() {
                    if !ip.is_empty() {
                        ip_addresses.push(ip.to_string());
                    }
                }
                if let Some(gateway) = network.gateway.as_deref() {
                    if !gateway.is_empty() {
                        gateways.push(gateway.to_string());
                    }
                }
            }
        }

        let autodetect = labels
            .get(LABEL_AUTODETECT)
            .map(|v| parse_bool_label(v))
            .unwrap_or(provider.try_docker_internal_network);

        Self {
            id: inspect.id.clone().unwrap_or_default(),
            name: inspect.name.clone().unwrap_or_default(),
            image: inspect
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            labels,
            network_mode,
            ports,
            ip_addresses,
            gateways,
            autodetect,
        }
    }

    fn label(&self, key: &str, default: &str) -> String {
        self.labels
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn label_bool(&self, key: &str, default: bool) -> bool {
        self.labels
            .get(key)
            .map(|v| parse_bool_label(v))
            .unwrap_or(default)
    }

    /// Hostname the endpoint takes on the mesh: the `name` label when
    /// present, otherwise the container name without its leading slash
    fn proxy_hostname(&self) -> anyhow::Result<String> {
        if let Some(custom) = self.labels.get(LABEL_NAME) {
            Url::parse(&format!("https://{}", custom))
                .map_err(|e| anyhow::anyhow!("invalid name label '{}': {}", custom, e))?;
            return Ok(custom.clone());
        }
        Ok(self.name.trim_start_matches('/').to_string())
    }

    fn tailscale_params(&self) -> anyhow::Result<TailscaleParams> {
        let mut auth_key = self.label(LABEL_AUTHKEY, "");

        let auth_key_file = self.label(LABEL_AUTHKEY_FILE, "");
        if !auth_key_file.is_empty() {
            auth_key = std::fs::read_to_string(&auth_key_file)
                .map(|k| k.trim().to_string())
                .map_err(|e| {
                    anyhow::anyhow!("error reading auth key file '{}': {}", auth_key_file, e)
                })?;
        }

        Ok(TailscaleParams {
            ephemeral: self.label_bool(LABEL_EPHEMERAL, model::DEFAULT_EPHEMERAL),
            run_web_client: self.label_bool(LABEL_RUN_WEB_CLIENT, model::DEFAULT_RUN_WEB_CLIENT),
            verbose: self.label_bool(LABEL_TSNET_VERBOSE, model::DEFAULT_VERBOSE),
            auth_key,
            tags: self.label(LABEL_TAGS, ""),
        })
    }

    async fn into_proxy_config(
        self,
        provider_name: &str,
        provider: &DockerProviderConfig,
        default_bridge_address: &str,
        prober: &dyn Prober,
    ) -> anyhow::Result<ProxyConfig> {
        let hostname = self.proxy_hostname()?;

        let mut config = ProxyConfig::new(self.id.clone(), hostname, provider_name.to_string());
        config.tailscale = self.tailscale_params()?;
        config.proxy_provider = self.label(LABEL_PROXY_PROVIDER, "");
        config.proxy_access_log =
            self.label_bool(LABEL_CONTAINER_ACCESS_LOG, model::DEFAULT_PROXY_ACCESS_LOG);
        let dashboard_label = self.label(LABEL_DASHBOARD_LABEL, &config.hostname);
        let mut dashboard_icon = self.label(LABEL_DASHBOARD_ICON, "");
        if dashboard_icon.is_empty() {
            dashboard_icon = guess_icon(&self.image).to_string();
        }
        config.dashboard = Dashboard {
            visible: self.label_bool(LABEL_DASHBOARD_VISIBLE, model::DEFAULT_DASHBOARD_VISIBLE),
            label: dashboard_label,
            icon: dashboard_icon,
        };

        config.ports = self
            .ports_from_labels(provider, default_bridge_address, prober)
            .await;

        // Legacy single-port fallback when no port labels exist
        if config.ports.is_empty() {
            match self
                .legacy_port(provider, default_bridge_address, prober)
                .await
            {
                Ok(port) => {
                    config.ports.insert("legacy".to_string(), port);
                }
                Err(e) => {
                    warn!(container = %self.id, error = %e, "no usable legacy port");
                }
            }
        }

        Ok(config)
    }

    /// Ports from `port.<key>` labels; individual parse or resolution
    /// failures drop the port, not the target
    async fn ports_from_labels(
        &self,
        provider: &DockerProviderConfig,
        default_bridge_address: &str,
        prober: &dyn Prober,
    ) -> HashMap<String, PortConfig> {
        let mut ports = HashMap::new();

        for (label, value) in &self.labels {
            if !label.starts_with(LABEL_PORT_PREFIX) {
                continue;
            }
            let key = label.trim_start_matches(LABEL_PORT_PREFIX);

            let (mut port, upstream) = match parse_long_port_spec(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!(container = %self.id, port = %key, error = %e, "error creating port config");
                    continue;
                }
            };

            match self
                .resolve_target_url(&upstream, provider, default_bridge_address, prober)
                .await
            {
                Ok(url) => {
                    debug!(container = %self.id, port = %port, target = %url, "target URL");
                    port.targets.push(url);
                    ports.insert(key.to_string(), port);
                }
                Err(e) => {
                    error!(container = %self.id, port = %key, error = %e, "error generating target");
                }
            }
        }

        ports
    }

    /// Legacy single-port config: proxy side fixed at 443/https, upstream
    /// side from the `container_port`/`scheme` labels or the first exposed
    /// port
    async fn legacy_port(
        &self,
        provider: &DockerProviderConfig,
        default_bridge_address: &str,
        prober: &dyn Prober,
    ) -> anyhow::Result<PortConfig> {
        let internal_port = match self.labels.get(LABEL_CONTAINER_PORT) {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| Error::InvalidConfig(format!("invalid container_port: {}", port)))?,
            None => *self
                .ports
                .keys()
                .next()
                .ok_or_else(|| Error::NoPortFound(self.id.clone()))?,
        };
        let scheme = self.label(LABEL_SCHEME, "http");

        let spec = format!("443/https:{}/{}", internal_port, scheme);
        let (mut port, upstream) = parse_long_port_spec(&spec)?;
        port.tls_validate = self.label_bool(LABEL_TLS_VALIDATE, model::DEFAULT_TLS_VALIDATE);
        port.tailscale.funnel = self.label_bool(LABEL_FUNNEL, model::DEFAULT_FUNNEL);

        let url = self
            .resolve_target_url(&upstream, provider, default_bridge_address, prober)
            .await?;
        port.targets.push(url);

        Ok(port)
    }

    /// Resolve the URL the reverse proxy dials for one upstream port.
    ///
    /// Order: own-host shortcut, autodetect probing (container addresses
    /// first, then gateways when the provider allows the engine's internal
    /// network), host-networking bridge fallback, published port.
    async fn resolve_target_url(
        &self,
        upstream: &UpstreamSpec,
        provider: &DockerProviderConfig,
        default_bridge_address: &str,
        prober: &dyn Prober,
    ) -> anyhow::Result<Url> {
        let internal_port = upstream.port;
        let published_port = self.ports.get(&internal_port).copied();

        // The container running this very process reaches itself on loopback
        if let Ok(own_hostname) = std::env::var("HOSTNAME") {
            if !own_hostname.is_empty() && self.id.starts_with(&own_hostname) {
                return Ok(Url::parse(&format!("http://127.0.0.1:{}", internal_port))?);
            }
        }

        if self.autodetect {
            let mut candidates: Vec<&str> =
                self.ip_addresses.iter().map(|s| s.as_str()).collect();
            if provider.try_docker_internal_network {
                candidates.extend(self.gateways.iter().map(|s| s.as_str()));
            }

            // The container may still be starting; retry the whole candidate
            // list a few times
            for round in 0..AUTODETECT_TRIES {
                info!(container = %self.id, round, "Trying to auto detect target URL");
                for addr in &candidates {
                    if prober.probe(addr, internal_port).await {
                        return Ok(Url::parse(&format!(
                            "{}://{}:{}",
                            upstream.scheme, addr, internal_port
                        ))?);
                    }
                }
                prober.sleep().await;
            }
        }

        if self.network_mode == "host" && !default_bridge_address.is_empty() {
            return Ok(Url::parse(&format!(
                "{}://{}:{}",
                upstream.scheme, provider.target_hostname, internal_port
            ))?);
        }

        match published_port {
            Some(published) => Ok(Url::parse(&format!(
                "{}://{}:{}",
                upstream.scheme, provider.target_hostname, published
            ))?),
            None => Err(Error::NoPortFound(self.id.clone()).into()),
        }
    }
}

/// Internal port number from a port-map key such as `"8080/tcp"`
fn parse_port_key(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}

/// Dashboard icon inferred from the image name when no label names one
fn guess_icon(image: &str) -> &'static str {
    const KNOWN: [&str; 16] = [
        "adguard",
        "gitea",
        "grafana",
        "homeassistant",
        "home-assistant",
        "jellyfin",
        "nextcloud",
        "nginx",
        "pihole",
        "plex",
        "portainer",
        "postgres",
        "prometheus",
        "radarr",
        "sonarr",
        "vaultwarden",
    ];

    let image = image.rsplit('/').next().unwrap_or(image);
    for name in KNOWN {
        if image.starts_with(name) {
            return name;
        }
    }
    "default"
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerConfig, EndpointSettings, HostConfig, NetworkSettings, PortBinding,
    };

    struct NeverProber;

    #[async_trait]
    impl Prober for NeverProber {
        async fn probe(&self, _addr: &str, _port: u16) -> bool {
            false
        }
        async fn sleep(&self) {}
    }

    struct RecordingProber {
        reachable: String,
        attempts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Prober for RecordingProber {
        async fn probe(&self, addr: &str, port: u16) -> bool {
            self.attempts.lock().push(format!("{}:{}", addr, port));
            addr == self.reachable
        }
        async fn sleep(&self) {}
    }

    fn provider_config() -> DockerProviderConfig {
        DockerProviderConfig {
            host: "unix:///var/run/docker.sock".into(),
            target_hostname: "172.31.0.1".into(),
            default_proxy_provider: String::new(),
            try_docker_internal_network: false,
        }
    }

    fn inspect_response(
        labels: Vec<(&str, &str)>,
        exposed: Vec<(u16, u16)>,
    ) -> ContainerInspectResponse {
        let mut port_map = HashMap::new();
        for (internal, published) in &exposed {
            port_map.insert(
                format!("{}/tcp", internal),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".into()),
                    host_port: Some(published.to_string()),
                }]),
            );
        }

        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.5".into()),
                gateway: Some("172.17.0.1".into()),
                ..Default::default()
            },
        );

        ContainerInspectResponse {
            id: Some("abc123def456".into()),
            name: Some("/webapp".into()),
            config: Some(ContainerConfig {
                image: Some("nginx:latest".into()),
                labels: Some(
                    labels
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                network_mode: Some("bridge".into()),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ports: Some(port_map),
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_bool_label() {
        for value in ["true", "TRUE", "1", "yes", "Yes", "on", "ON"] {
            assert!(parse_bool_label(value), "{} should be truthy", value);
        }
        for value in ["false", "0", "no", "off", "", "enabled"] {
            assert!(!parse_bool_label(value), "{} should be falsy", value);
        }
    }

    #[test]
    fn test_guess_icon() {
        assert_eq!(guess_icon("jellyfin/jellyfin:10"), "jellyfin");
        assert_eq!(guess_icon("ghcr.io/linuxserver/radarr"), "radarr");
        assert_eq!(guess_icon("mycorp/internal-tool"), "default");
    }

    #[test]
    fn test_hostname_from_label_and_name() {
        let inspect = inspect_response(vec![("meshgate.name", "web")], vec![]);
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        assert_eq!(info.proxy_hostname().unwrap(), "web");

        let inspect = inspect_response(vec![], vec![]);
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        assert_eq!(info.proxy_hostname().unwrap(), "webapp");

        let inspect = inspect_response(vec![("meshgate.name", "bad name!")], vec![]);
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        assert!(info.proxy_hostname().is_err());
    }

    #[tokio::test]
    async fn test_port_labels_with_published_fallback() {
        let inspect = inspect_response(
            vec![
                ("meshgate.enable", "true"),
                ("meshgate.name", "web"),
                ("meshgate.port.http", "80/http:8080/http"),
            ],
            vec![(8080, 32811)],
        );
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        let config = info
            .into_proxy_config("local", &provider_config(), "", &NeverProber)
            .await
            .unwrap();

        assert_eq!(config.hostname, "web");
        let port = &config.ports["http"];
        assert_eq!(port.proxy_port, 80);
        assert_eq!(
            port.first_target().unwrap().as_str(),
            "http://172.31.0.1:32811/"
        );
    }

    #[tokio::test]
    async fn test_autodetect_prefers_container_address() {
        let inspect = inspect_response(
            vec![
                ("meshgate.enable", "true"),
                ("meshgate.autodetect", "true"),
                ("meshgate.port.http", "80/http:8080/http"),
            ],
            vec![(8080, 32811)],
        );
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        let prober = RecordingProber {
            reachable: "172.17.0.5".into(),
            attempts: Mutex::new(Vec::new()),
        };
        let config = info
            .into_proxy_config("local", &provider_config(), "", &prober)
            .await
            .unwrap();

        let port = &config.ports["http"];
        assert_eq!(
            port.first_target().unwrap().as_str(),
            "http://172.17.0.5:8080/"
        );
        assert_eq!(prober.attempts.lock().first().unwrap(), "172.17.0.5:8080");
    }

    #[tokio::test]
    async fn test_autodetect_gateways_only_with_internal_network() {
        let inspect = inspect_response(
            vec![
                ("meshgate.autodetect", "true"),
                ("meshgate.port.http", "80/http:9999/http"),
            ],
            vec![],
        );
        let mut provider = provider_config();
        provider.try_docker_internal_network = true;

        let info = ContainerInfo::from_inspect(&inspect, None, &provider);
        let prober = RecordingProber {
            reachable: "172.17.0.1".into(),
            attempts: Mutex::new(Vec::new()),
        };
        let config = info
            .into_proxy_config("local", &provider, "172.17.0.1", &prober)
            .await
            .unwrap();

        // Container address probed first, gateway second
        let attempts = prober.attempts.lock();
        assert_eq!(attempts[0], "172.17.0.5:9999");
        assert_eq!(attempts[1], "172.17.0.1:9999");
        drop(attempts);

        assert_eq!(
            config.ports["http"].first_target().unwrap().as_str(),
            "http://172.17.0.1:9999/"
        );
    }

    #[tokio::test]
    async fn test_legacy_port_fallback() {
        let inspect = inspect_response(
            vec![
                ("meshgate.enable", "true"),
                ("meshgate.scheme", "https"),
                ("meshgate.tls_validate", "false"),
                ("meshgate.funnel", "true"),
            ],
            vec![(8443, 32900)],
        );
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        let config = info
            .into_proxy_config("local", &provider_config(), "", &NeverProber)
            .await
            .unwrap();

        let port = &config.ports["legacy"];
        assert_eq!(port.proxy_port, 443);
        assert!(!port.tls_validate);
        assert!(port.tailscale.funnel);
        assert_eq!(
            port.first_target().unwrap().as_str(),
            "https://172.31.0.1:32900/"
        );
    }

    #[tokio::test]
    async fn test_no_discoverable_ports_yields_empty_port_map() {
        let inspect = inspect_response(vec![("meshgate.enable", "true")], vec![]);
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        let config = info
            .into_proxy_config("local", &provider_config(), "", &NeverProber)
            .await
            .unwrap();

        // The proxy built from this config goes to Error instead of Running
        assert!(config.ports.is_empty());
    }

    #[tokio::test]
    async fn test_mesh_params_and_dashboard_from_labels() {
        let inspect = inspect_response(
            vec![
                ("meshgate.enable", "true"),
                ("meshgate.ephemeral", "true"),
                ("meshgate.tags", "tag:web"),
                ("meshgate.proxy_provider", "ts-alt"),
                ("meshgate.container_access_log", "false"),
                ("meshgate.dashboard_visible", "false"),
                ("meshgate.dashboard_label", "Web App"),
                ("meshgate.port.http", "80/http:8080/http"),
            ],
            vec![(8080, 32811)],
        );
        let info = ContainerInfo::from_inspect(&inspect, None, &provider_config());
        let config = info
            .into_proxy_config("local", &provider_config(), "", &NeverProber)
            .await
            .unwrap();

        assert!(config.tailscale.ephemeral);
        assert_eq!(config.tailscale.tags, "tag:web");
        assert_eq!(config.proxy_provider, "ts-alt");
        assert!(!config.proxy_access_log);
        assert!(!config.dashboard.visible);
        assert_eq!(config.dashboard.label, "Web App");
        assert_eq!(config.dashboard.icon, "nginx");
    }
}
