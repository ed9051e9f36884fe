//! List-file target provider
//!
//! Watches a single YAML file mapping names to proxy entries. On reload the
//! new map is diffed against the last-known one: new names start, removed
//! names stop, changed entries restart, unchanged entries are left alone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ListProviderConfig;
use crate::error::Error;
use crate::files::{self, FileWatcher};
use crate::model::{
    parse_short_port_spec, Dashboard, PortConfig, ProxyConfig, TailscaleParams, TailscalePort,
};
use crate::target::{TargetAction, TargetEvent, TargetProvider};

/// One entry of the list file; a restricted view of the proxy config
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ListEntry {
    dashboard: Dashboard,
    ports: HashMap<String, ListPort>,
    #[serde(rename = "proxyProvider")]
    proxy_provider: String,
    tailscale: TailscaleParams,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ListPort {
    targets: Vec<String>,
    tailscale: TailscalePort,
    #[serde(rename = "isRedirect")]
    is_redirect: bool,
    #[serde(rename = "tlsValidate")]
    tls_validate: bool,
}

impl Default for ListPort {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            tailscale: TailscalePort::default(),
            is_redirect: false,
            tls_validate: true,
        }
    }
}

struct ListInner {
    name: String,
    config: ListProviderConfig,
    path: PathBuf,
    /// Current view of the file, valid entries only
    entries: Mutex<HashMap<String, ListEntry>>,
    /// Entries a proxy has been materialized for
    active: Mutex<HashMap<String, ListEntry>>,
    events_tx: Mutex<Option<mpsc::Sender<TargetEvent>>>,
    watcher: Mutex<Option<FileWatcher>>,
}

pub struct ListTargetProvider {
    inner: Arc<ListInner>,
    poll_interval: Duration,
}

impl ListTargetProvider {
    pub fn new(name: &str, config: &ListProviderConfig) -> anyhow::Result<Self> {
        let path = PathBuf::from(&config.filename);
        let entries = load_entries(&path)?;

        Ok(Self {
            inner: Arc::new(ListInner {
                name: name.to_string(),
                config: config.clone(),
                path,
                entries: Mutex::new(entries),
                active: Mutex::new(HashMap::new()),
                events_tx: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
            poll_interval: Duration::from_secs(1),
        })
    }

    /// Override the file-watch poll interval (tests, fast-reload setups)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Load the file, dropping entries that fail to deserialize
fn load_entries(path: &PathBuf) -> anyhow::Result<HashMap<String, ListEntry>> {
    let raw: HashMap<String, serde_yaml::Value> = files::load_yaml(path)?;

    let mut entries = HashMap::new();
    for (name, value) in raw {
        match serde_yaml::from_value::<ListEntry>(value) {
            Ok(entry) => {
                entries.insert(name, entry);
            }
            Err(e) => {
                warn!(entry = %name, error = %e, "Invalid list entry dropped");
            }
        }
    }
    Ok(entries)
}

impl ListInner {
    /// Reload the file and translate the difference into events
    async fn reload(&self) {
        info!(file = %self.path.display(), "config changed, reloading");

        let new_entries = match load_entries(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                error!(file = %self.path.display(), error = %e, "error loading config");
                return;
            }
        };

        let old_entries = {
            let mut entries = self.entries.lock();
            std::mem::replace(&mut *entries, new_entries.clone())
        };

        let events = self.events_tx.lock().clone();
        let events = match events {
            Some(events) => events,
            None => return,
        };

        for name in old_entries.keys() {
            if !new_entries.contains_key(name) {
                let _ = events.send(self.event(name, TargetAction::Stop)).await;
            }
        }

        for (name, entry) in &new_entries {
            match old_entries.get(name) {
                None => {
                    let _ = events.send(self.event(name, TargetAction::Start)).await;
                }
                Some(old) if old != entry => {
                    let _ = events.send(self.event(name, TargetAction::Restart)).await;
                }
                Some(_) => {}
            }
        }
    }

    fn event(&self, id: &str, action: TargetAction) -> TargetEvent {
        TargetEvent {
            id: id.to_string(),
            action,
            provider: self.name.clone(),
        }
    }

    /// Translate list ports into port configs, dropping invalid ones
    fn build_ports(&self, ports: &HashMap<String, ListPort>) -> HashMap<String, PortConfig> {
        let mut result = HashMap::new();

        for (key, list_port) in ports {
            let mut port = match parse_short_port_spec(key) {
                Ok(port) => port,
                Err(e) => {
                    error!(port = %key, error = %e, "error creating port config");
                    continue;
                }
            };

            port.is_redirect = list_port.is_redirect;
            port.tls_validate = list_port.tls_validate;
            port.tailscale = list_port.tailscale;

            for target in &list_port.targets {
                match Url::parse(target) {
                    Ok(url) if url.has_host() && !url.scheme().is_empty() => {
                        port.targets.push(url);
                    }
                    _ => {
                        error!(port = %key, target = %target, "Invalid target URL");
                    }
                }
            }

            if port.targets.is_empty() {
                error!(port = %key, "no targets found for port");
                continue;
            }

            result.insert(key.clone(), port);
        }

        result
    }
}

#[async_trait]
impl TargetProvider for ListTargetProvider {
    async fn watch_events(
        &self,
        events: mpsc::Sender<TargetEvent>,
        _errors: mpsc::Sender<anyhow::Error>,
    ) {
        debug!(provider = %self.inner.name, "Start WatchEvents");
        *self.inner.events_tx.lock() = Some(events.clone());

        // Reloads run on their own task; the watcher callback only nudges it
        let (changed_tx, mut changed_rx) = mpsc::channel::<()>(1);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while changed_rx.recv().await.is_some() {
                inner.reload().await;
            }
        });

        let watcher = FileWatcher::spawn_with_interval(
            self.inner.path.clone(),
            self.poll_interval,
            move || {
                let _ = changed_tx.try_send(());
            },
        );
        *self.inner.watcher.lock() = Some(watcher);

        // Initial Start events for everything currently in the file
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let names: Vec<String> = inner.entries.lock().keys().cloned().collect();
            for name in names {
                let _ = events.send(inner.event(&name, TargetAction::Start)).await;
            }
        });
    }

    async fn add_target(&self, id: &str) -> anyhow::Result<ProxyConfig> {
        let entry = self
            .inner
            .entries
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))?;

        let mut config =
            ProxyConfig::new(id.to_string(), id.to_string(), self.inner.name.clone());

        config.proxy_provider = if entry.proxy_provider.is_empty() {
            self.inner.config.default_proxy_provider.clone()
        } else {
            entry.proxy_provider.clone()
        };
        config.proxy_access_log = self.inner.config.default_proxy_access_log;
        config.tailscale = entry.tailscale.clone();
        config.dashboard = entry.dashboard.clone();
        config.ports = self.inner.build_ports(&entry.ports);

        if config.ports.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "list entry '{}' has no usable ports",
                id
            ))
            .into());
        }

        self.inner.active.lock().insert(id.to_string(), entry);
        Ok(config)
    }

    async fn delete_proxy(&self, id: &str) -> anyhow::Result<()> {
        if self.inner.active.lock().remove(id).is_none() {
            return Err(Error::TargetNotFound(id.to_string()).into());
        }
        Ok(())
    }

    fn default_proxy_provider_name(&self) -> String {
        self.inner.config.default_proxy_provider.clone()
    }

    async fn close(&self) {
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.stop();
        }

        let active: Vec<String> = self.inner.active.lock().keys().cloned().collect();
        let events = self.inner.events_tx.lock().clone();
        if let Some(events) = events {
            for name in active {
                let _ = events
                    .send(self.inner.event(&name, TargetAction::Stop))
                    .await;
            }
        }
    }
}
