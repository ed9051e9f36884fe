use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::files;

/// Default control plane for tailscale mesh providers
pub const DEFAULT_CONTROL_URL: &str = "https://controlplane.tailscale.com";

/// Global configuration for meshgate
///
/// Loaded once at startup and immutable afterwards. If the file does not
/// exist a default configuration is generated and saved in its place.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Mesh provider used when neither the proxy config nor the target
    /// provider names one
    #[serde(default = "default_proxy_provider", rename = "defaultProxyProvider")]
    pub default_proxy_provider: String,

    /// Container-runtime target providers
    #[serde(default)]
    pub docker: HashMap<String, DockerProviderConfig>,

    /// List-file target providers
    #[serde(default)]
    pub lists: HashMap<String, ListProviderConfig>,

    /// Mesh providers
    #[serde(default)]
    pub tailscale: TailscaleConfig,

    /// Management/front-door HTTP server
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Front-door TLS via ACME DNS-01
    #[serde(default, rename = "letsEncrypt")]
    pub lets_encrypt: LetsEncryptConfig,

    /// Global default for per-proxy access logging
    #[serde(default = "default_true", rename = "proxyAccessLog")]
    pub proxy_access_log: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DockerProviderConfig {
    /// Docker daemon address (unix socket or tcp)
    #[serde(default = "default_docker_host")]
    pub host: String,

    /// Hostname targets are dialed on when the published port is used
    #[serde(default = "default_target_hostname", rename = "targetHostname")]
    pub target_hostname: String,

    /// Mesh provider for targets of this provider that don't name one
    #[serde(default, rename = "defaultProxyProvider")]
    pub default_proxy_provider: String,

    /// Probe container/gateway addresses before falling back to the
    /// published port
    #[serde(default, rename = "tryDockerInternalNetwork")]
    pub try_docker_internal_network: bool,
}

impl Default for DockerProviderConfig {
    fn default() -> Self {
        Self {
            host: default_docker_host(),
            target_hostname: default_target_hostname(),
            default_proxy_provider: String::new(),
            try_docker_internal_network: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListProviderConfig {
    /// YAML file holding the proxy list
    pub filename: String,

    /// Mesh provider for entries that don't name one
    #[serde(default, rename = "defaultProxyProvider")]
    pub default_proxy_provider: String,

    /// Access-log default for proxies of this provider
    #[serde(default = "default_true", rename = "defaultProxyAccessLog")]
    pub default_proxy_access_log: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TailscaleConfig {
    /// Per-provider mesh server configurations
    #[serde(default)]
    pub providers: HashMap<String, TailscaleServerConfig>,

    /// Directory for per-node state (auth keys, certificates)
    #[serde(default = "default_data_dir", rename = "dataDir")]
    pub data_dir: String,
}

impl Default for TailscaleConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TailscaleServerConfig {
    /// Preshared auth key used when a proxy doesn't carry its own
    #[serde(default, rename = "authKey")]
    pub auth_key: String,

    /// File to read the preshared auth key from
    #[serde(default, rename = "authKeyFile")]
    pub auth_key_file: String,

    /// OAuth client credentials; when set, auth keys are minted on demand
    #[serde(default, rename = "clientId")]
    pub client_id: String,

    #[serde(default, rename = "clientSecret")]
    pub client_secret: String,

    /// Tags assigned to nodes created with minted keys
    #[serde(default)]
    pub tags: String,

    #[serde(default = "default_control_url", rename = "controlUrl")]
    pub control_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_bind_hostname")]
    pub hostname: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            hostname: default_bind_hostname(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// One of trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LetsEncryptConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Token for the DNS API used to provision challenge TXT records
    #[serde(default, rename = "dnsApiToken")]
    pub dns_api_token: String,

    #[serde(default, rename = "domainName")]
    pub domain_name: String,

    #[serde(default = "default_cert_cache_dir", rename = "cacheDir")]
    pub cache_dir: String,
}

impl Default for LetsEncryptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dns_api_token: String::new(),
            domain_name: String::new(),
            cache_dir: default_cert_cache_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, generating a default file when
    /// none exists. Auth key files are read here so providers only ever see
    /// resolved keys.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Config = if path.exists() {
            files::load_yaml(path)?
        } else {
            info!(path = %path.display(), "Generating default configuration");
            let config = Config::default_with_providers();
            files::save_yaml(path, &config)?;
            config
        };

        // Resolve auth key files unless OAuth credentials take precedence
        for provider in config.tailscale.providers.values_mut() {
            if !provider.client_id.is_empty() && !provider.client_secret.is_empty() {
                continue;
            }
            if !provider.auth_key_file.is_empty() {
                let key = std::fs::read_to_string(&provider.auth_key_file).map_err(|e| {
                    anyhow::anyhow!(
                        "failed to read auth key file '{}': {}",
                        provider.auth_key_file,
                        e
                    )
                })?;
                provider.auth_key = key.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Default configuration with one docker target provider and one mesh
    /// provider, mirroring a fresh install
    fn default_with_providers() -> Self {
        let mut config = Config {
            default_proxy_provider: default_proxy_provider(),
            docker: HashMap::new(),
            lists: HashMap::new(),
            tailscale: TailscaleConfig::default(),
            http: HttpConfig::default(),
            log: LogConfig::default(),
            lets_encrypt: LetsEncryptConfig::default(),
            proxy_access_log: true,
        };
        config
            .docker
            .insert("local".to_string(), DockerProviderConfig::default());
        config.tailscale.providers.insert(
            "default".to_string(),
            TailscaleServerConfig {
                control_url: default_control_url(),
                ..Default::default()
            },
        );
        config
    }

    /// Validate the configuration; failures here are fatal at process start
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.log.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("invalid log level: {}", other),
        }

        if self.http.port == 0 {
            anyhow::bail!("http.port must be non-zero");
        }

        for (name, provider) in &self.docker {
            if provider.host.is_empty() {
                anyhow::bail!("docker provider '{}' has an empty host", name);
            }
        }

        for (name, provider) in &self.lists {
            if provider.filename.is_empty() {
                anyhow::bail!("list provider '{}' has an empty filename", name);
            }
        }

        for (name, provider) in &self.tailscale.providers {
            if provider.control_url.is_empty() {
                anyhow::bail!("tailscale provider '{}' has an empty control URL", name);
            }
        }

        if self.lets_encrypt.enabled {
            if self.lets_encrypt.domain_name.is_empty() {
                anyhow::bail!("letsEncrypt.domainName is required when enabled");
            }
            if self.lets_encrypt.dns_api_token.is_empty() {
                anyhow::bail!("letsEncrypt.dnsApiToken is required when enabled");
            }
        }

        Ok(())
    }
}

fn default_proxy_provider() -> String {
    "default".to_string()
}

fn default_docker_host() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_target_hostname() -> String {
    "172.31.0.1".to_string()
}

fn default_data_dir() -> String {
    "/data/".to_string()
}

fn default_control_url() -> String {
    DEFAULT_CONTROL_URL.to_string()
}

fn default_bind_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cert_cache_dir() -> String {
    "/data/certs".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshgate.yaml");

        let config = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.default_proxy_provider, "default");
        assert!(config.docker.contains_key("local"));
        assert!(config.tailscale.providers.contains_key("default"));
        assert_eq!(config.http.port, 8080);

        // Loading the generated file back yields the same configuration
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(
            reloaded.default_proxy_provider,
            config.default_proxy_provider
        );
        assert_eq!(reloaded.http.port, config.http.port);
    }

    #[test]
    fn test_parses_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshgate.yaml");
        std::fs::write(
            &path,
            r#"
defaultProxyProvider: ts-main
docker:
  local:
    host: unix:///var/run/docker.sock
    targetHostname: 172.31.0.1
    tryDockerInternalNetwork: true
lists:
  homelab:
    filename: /config/homelab.yaml
tailscale:
  dataDir: /data/
  providers:
    ts-main:
      authKey: tskey-test
http:
  hostname: 0.0.0.0
  port: 8080
log:
  level: debug
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.default_proxy_provider, "ts-main");
        assert!(config.docker["local"].try_docker_internal_network);
        assert_eq!(config.lists["homelab"].filename, "/config/homelab.yaml");
        assert_eq!(config.tailscale.providers["ts-main"].auth_key, "tskey-test");
        assert_eq!(
            config.tailscale.providers["ts-main"].control_url,
            DEFAULT_CONTROL_URL
        );
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_auth_key_file_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("authkey");
        std::fs::write(&key_path, "tskey-from-file\n").unwrap();

        let path = dir.path().join("meshgate.yaml");
        std::fs::write(
            &path,
            format!(
                "tailscale:\n  providers:\n    default:\n      authKeyFile: {}\n",
                key_path.display()
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.tailscale.providers["default"].auth_key,
            "tskey-from-file"
        );
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default_with_providers();
        config.log.level = "noisy".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default_with_providers();
        config.http.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default_with_providers();
        config.lets_encrypt.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshgate.yaml");
        std::fs::write(&path, "bogusSection: true\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
