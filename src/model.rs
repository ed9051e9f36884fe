//! Normalized proxy model shared by target providers, proxies and the manager

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Header injected with the mesh login name of the caller
pub const HEADER_USERNAME: &str = "X-Username";
/// Header injected with the mesh display name of the caller
pub const HEADER_DISPLAY_NAME: &str = "X-Display-Name";
/// Header injected with the mesh profile picture URL of the caller
pub const HEADER_PROFILE_PIC_URL: &str = "X-Profile-Pic-URL";

pub const DEFAULT_PROXY_ACCESS_LOG: bool = true;
pub const DEFAULT_TLS_VALIDATE: bool = true;
pub const DEFAULT_FUNNEL: bool = false;
pub const DEFAULT_EPHEMERAL: bool = false;
pub const DEFAULT_RUN_WEB_CLIENT: bool = false;
pub const DEFAULT_VERBOSE: bool = false;
pub const DEFAULT_DASHBOARD_VISIBLE: bool = true;

/// Observable lifecycle state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    /// Proxy registered, endpoint not started yet
    Initializing,
    /// Endpoint started, waiting for the mesh join to complete
    Starting,
    /// Mesh requires interactive login; an auth URL is available
    Authenticating,
    /// Joined the mesh and serving
    Running,
    /// Close in progress
    Stopping,
    /// Closed; all listeners released
    Stopped,
    /// A fatal step failed; requires a restart event to recover
    Error,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyStatus::Initializing => "initializing",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Authenticating => "authenticating",
            ProxyStatus::Running => "running",
            ProxyStatus::Stopping => "stopping",
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status event published on the manager's event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEvent {
    /// Hostname of the proxy the event belongs to
    pub id: String,
    pub status: ProxyStatus,
}

/// Mesh identity of an inbound connection, resolved via the endpoint's whois
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub display_name: String,
    pub profile_pic_url: String,
}

impl Identity {
    /// An empty identity means the connection carried no mesh identity
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.display_name.is_empty() && self.profile_pic_url.is_empty()
    }
}

/// Per-node mesh parameters
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TailscaleParams {
    pub ephemeral: bool,
    #[serde(rename = "runWebClient")]
    pub run_web_client: bool,
    pub verbose: bool,
    #[serde(rename = "authKey")]
    pub auth_key: String,
    pub tags: String,
}

/// Per-port mesh flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TailscalePort {
    pub funnel: bool,
}

/// Dashboard metadata carried on a proxy config
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Dashboard {
    pub visible: bool,
    pub label: String,
    pub icon: String,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self {
            visible: DEFAULT_DASHBOARD_VISIBLE,
            label: String::new(),
            icon: String::new(),
        }
    }
}

/// Protocol the mesh endpoint speaks on a proxy port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
}

impl Protocol {
    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(Error::InvalidConfig(format!(
                "unknown proxy protocol: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
        }
    }
}

/// Configuration of one proxy port.
///
/// `targets` is an ordered list of upstream URLs; only the first entry is
/// dialed. Additional entries are accepted and kept for forward
/// compatibility but have no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    pub proxy_protocol: Protocol,
    pub proxy_port: u16,
    pub tailscale: TailscalePort,
    pub tls_validate: bool,
    pub is_redirect: bool,
    pub targets: Vec<Url>,
}

impl PortConfig {
    fn new(proxy_port: u16, proxy_protocol: Protocol) -> Self {
        Self {
            proxy_protocol,
            proxy_port,
            tailscale: TailscalePort::default(),
            tls_validate: DEFAULT_TLS_VALIDATE,
            is_redirect: false,
            targets: Vec::new(),
        }
    }

    /// The active upstream, if any
    pub fn first_target(&self) -> Option<&Url> {
        self.targets.first()
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proxy_port, self.proxy_protocol.as_str())
    }
}

/// Upstream half of a long-form port spec, before URL resolution.
///
/// The container provider turns this into a concrete target URL once it
/// knows which address the container is reachable on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    pub scheme: String,
    pub port: u16,
}

/// Port option suffixes accepted after a long-form port spec
const PORT_OPTION_NO_TLS_VALIDATE: &str = "no_tls_validate";
const PORT_OPTION_FUNNEL: &str = "funnel";

/// Parse a short port spec of the form `"<proxy_port>/<proxy_protocol>"`
pub fn parse_short_port_spec(spec: &str) -> Result<PortConfig, Error> {
    let (port, protocol) = split_port_protocol(spec)?;
    Ok(PortConfig::new(port, protocol))
}

/// Parse a long port spec of the form
/// `"<proxy_port>/<proxy_protocol>:<upstream_port>/<upstream_scheme>[,option…]"`.
///
/// Options: `no_tls_validate`, `funnel`.
pub fn parse_long_port_spec(spec: &str) -> Result<(PortConfig, UpstreamSpec), Error> {
    let mut parts = spec.split(',');
    let head = parts.next().unwrap_or_default().trim();

    let (proxy_side, upstream_side) = head.split_once(':').ok_or_else(|| {
        Error::InvalidConfig(format!("port spec missing upstream half: {}", spec))
    })?;

    let (proxy_port, proxy_protocol) = split_port_protocol(proxy_side)?;
    let mut port = PortConfig::new(proxy_port, proxy_protocol);

    let (upstream_port, upstream_scheme) = match upstream_side.split_once('/') {
        Some((p, s)) => (parse_port_number(p)?, s.trim().to_string()),
        None => (parse_port_number(upstream_side)?, "http".to_string()),
    };

    for option in parts {
        match option.trim() {
            PORT_OPTION_NO_TLS_VALIDATE => port.tls_validate = false,
            PORT_OPTION_FUNNEL => port.tailscale.funnel = true,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown port option: {}",
                    other
                )))
            }
        }
    }

    Ok((
        port,
        UpstreamSpec {
            scheme: upstream_scheme,
            port: upstream_port,
        },
    ))
}

fn split_port_protocol(s: &str) -> Result<(u16, Protocol), Error> {
    let (port, protocol) = s
        .trim()
        .split_once('/')
        .ok_or_else(|| Error::InvalidConfig(format!("port spec missing protocol: {}", s)))?;
    Ok((parse_port_number(port)?, Protocol::parse(protocol.trim())?))
}

fn parse_port_number(s: &str) -> Result<u16, Error> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| Error::InvalidConfig(format!("invalid port number: {}", s)))
}

/// Normalized description of one to-be-proxied service
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Opaque id of the target within its provider (container id, list key)
    pub target_id: String,
    /// DNS-like name the endpoint takes on the mesh; registry key
    pub hostname: String,
    /// Name of the target provider that materialized this config
    pub target_provider: String,
    /// Mesh provider override; empty means "resolve a default"
    pub proxy_provider: String,
    pub tailscale: TailscaleParams,
    pub proxy_access_log: bool,
    pub dashboard: Dashboard,
    pub ports: HashMap<String, PortConfig>,
}

impl ProxyConfig {
    pub fn new(target_id: String, hostname: String, target_provider: String) -> Self {
        Self {
            target_id,
            hostname,
            target_provider,
            proxy_provider: String::new(),
            tailscale: TailscaleParams::default(),
            proxy_access_log: DEFAULT_PROXY_ACCESS_LOG,
            dashboard: Dashboard::default(),
            ports: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_port_spec() {
        let port = parse_short_port_spec("80/http").unwrap();
        assert_eq!(port.proxy_port, 80);
        assert_eq!(port.proxy_protocol, Protocol::Http);
        assert!(port.tls_validate);
        assert!(!port.tailscale.funnel);
        assert!(port.targets.is_empty());
    }

    #[test]
    fn test_parse_long_port_spec() {
        let (port, upstream) = parse_long_port_spec("443/https:8080/http").unwrap();
        assert_eq!(port.proxy_port, 443);
        assert_eq!(port.proxy_protocol, Protocol::Https);
        assert_eq!(upstream.port, 8080);
        assert_eq!(upstream.scheme, "http");
    }

    #[test]
    fn test_parse_long_port_spec_options() {
        let (port, _) = parse_long_port_spec("443/https:8080/https,no_tls_validate,funnel").unwrap();
        assert!(!port.tls_validate);
        assert!(port.tailscale.funnel);
    }

    #[test]
    fn test_parse_long_port_spec_default_scheme() {
        let (_, upstream) = parse_long_port_spec("80/http:3000").unwrap();
        assert_eq!(upstream.scheme, "http");
        assert_eq!(upstream.port, 3000);
    }

    #[test]
    fn test_parse_port_spec_errors() {
        assert!(parse_short_port_spec("80").is_err());
        assert!(parse_short_port_spec("80/ftp").is_err());
        assert!(parse_long_port_spec("80/http").is_err());
        assert!(parse_long_port_spec("80/http:8080/http,bogus").is_err());
        assert!(parse_long_port_spec("notaport/http:8080").is_err());
    }

    #[test]
    fn test_port_config_display() {
        let port = parse_short_port_spec("443/https").unwrap();
        assert_eq!(port.to_string(), "443/https");
    }

    #[test]
    fn test_identity_is_empty() {
        assert!(Identity::default().is_empty());
        let who = Identity {
            username: "u@example.com".into(),
            ..Default::default()
        };
        assert!(!who.is_empty());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProxyStatus::Authenticating.to_string(), "authenticating");
        assert_eq!(ProxyStatus::Stopped.to_string(), "stopped");
    }
}
