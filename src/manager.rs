//! Proxy manager: registry of live proxies and event dispatch
//!
//! Holds the live proxies keyed by hostname together with the registered
//! target and mesh providers, fans target events in from all providers, and
//! fans status events out to subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::mesh::MeshProvider;
use crate::model::{ProxyConfig, ProxyEvent, ProxyStatus};
use crate::proxy::Proxy;
use crate::target::{TargetAction, TargetEvent, TargetProvider};

/// Capacity of each status subscriber's sink; publishes are non-blocking and
/// drop when the sink is full
const SUBSCRIBER_BUFFER: usize = 64;

/// Capacity of the per-provider event ingestion channel
const EVENT_BUFFER: usize = 16;

struct Registry {
    proxies: HashMap<String, Arc<Proxy>>,
    target_providers: HashMap<String, Arc<dyn TargetProvider>>,
    mesh_providers: HashMap<String, Arc<dyn MeshProvider>>,
    subscribers: HashMap<u64, mpsc::Sender<ProxyEvent>>,
    next_subscriber: u64,
}

pub struct ProxyManager {
    registry: RwLock<Registry>,
    default_mesh_provider: String,
}

impl ProxyManager {
    /// Create a new manager. Returns `Arc<Self>` because the manager is
    /// shared across event-ingestion tasks and proxy status callbacks.
    pub fn new(default_mesh_provider: String) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry {
                proxies: HashMap::new(),
                target_providers: HashMap::new(),
                mesh_providers: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber: 0,
            }),
            default_mesh_provider,
        })
    }

    pub fn add_target_provider(&self, name: &str, provider: Arc<dyn TargetProvider>) {
        self.registry
            .write()
            .target_providers
            .insert(name.to_string(), provider);
    }

    pub fn add_mesh_provider(&self, name: &str, provider: Arc<dyn MeshProvider>) {
        self.registry
            .write()
            .mesh_providers
            .insert(name.to_string(), provider);
    }

    pub fn target_provider_count(&self) -> usize {
        self.registry.read().target_providers.len()
    }

    pub fn mesh_provider_count(&self) -> usize {
        self.registry.read().mesh_providers.len()
    }

    pub fn get_proxy(&self, hostname: &str) -> Option<Arc<Proxy>> {
        self.registry.read().proxies.get(hostname).cloned()
    }

    /// Snapshot of the live proxies; callers iterate the clone rather than
    /// re-reading the registry
    pub fn snapshot(&self) -> HashMap<String, Arc<Proxy>> {
        self.registry.read().proxies.clone()
    }

    /// Subscribe to proxy status events. The returned id is used to
    /// unsubscribe; the sink is bounded and lossy by design.
    pub fn subscribe_status_events(&self) -> (u64, mpsc::Receiver<ProxyEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut registry = self.registry.write();
        let id = registry.next_subscriber;
        registry.next_subscriber += 1;
        registry.subscribers.insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber; dropping its sender closes the sink
    pub fn unsubscribe_status_events(&self, id: u64) {
        self.registry.write().subscribers.remove(&id);
    }

    /// Publish a status event to every subscriber without blocking; slow
    /// subscribers lose events rather than stalling lifecycle work
    fn broadcast(&self, event: ProxyEvent) {
        let registry = self.registry.read();
        for sink in registry.subscribers.values() {
            let _ = sink.try_send(event.clone());
        }
    }

    /// Spawn one ingestion worker per registered target provider. Each event
    /// is dispatched on a fresh task; per-target ordering comes from the
    /// provider emitting events for one id serially.
    pub fn watch_events(self: &Arc<Self>) {
        let providers: Vec<(String, Arc<dyn TargetProvider>)> = {
            let registry = self.registry.read();
            registry
                .target_providers
                .iter()
                .map(|(name, provider)| (name.clone(), Arc::clone(provider)))
                .collect()
        };

        for (name, provider) in providers {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let (events_tx, mut events_rx) = mpsc::channel::<TargetEvent>(EVENT_BUFFER);
                let (errors_tx, mut errors_rx) = mpsc::channel::<anyhow::Error>(1);

                provider.watch_events(events_tx, errors_tx).await;

                // A provider dropping its error sender is not an error; a
                // message on it is terminal for this watcher
                let mut errors_open = true;
                loop {
                    tokio::select! {
                        event = events_rx.recv() => {
                            let event = match event {
                                Some(event) => event,
                                None => break,
                            };
                            let manager = Arc::clone(&manager);
                            tokio::spawn(async move {
                                manager.handle_target_event(event).await;
                            });
                        }
                        err = errors_rx.recv(), if errors_open => {
                            match err {
                                Some(err) => {
                                    error!(provider = %name, error = %err, "Error watching events");
                                    break;
                                }
                                None => errors_open = false,
                            }
                        }
                    }
                }
            });
        }
    }

    pub async fn handle_target_event(self: &Arc<Self>, event: TargetEvent) {
        match event.action {
            TargetAction::Start => self.event_start(&event).await,
            TargetAction::Stop => self.event_stop(&event).await,
            TargetAction::Restart => {
                self.event_stop(&event).await;
                self.event_start(&event).await;
            }
        }
    }

    /// Materialize a config from the provider and start a proxy for it
    async fn event_start(self: &Arc<Self>, event: &TargetEvent) {
        debug!(target_id = %event.id, "Adding target");

        let provider = match self.get_target_provider(&event.provider) {
            Some(provider) => provider,
            None => {
                error!(provider = %event.provider, "Unknown target provider for event");
                return;
            }
        };

        // Materialization failures drop the event; a later restart retries
        let config = match provider.add_target(&event.id).await {
            Ok(config) => config,
            Err(e) => {
                error!(target_id = %event.id, error = %e, "Error adding target");
                return;
            }
        };

        self.start_proxy(config).await;
    }

    async fn start_proxy(self: &Arc<Self>, config: ProxyConfig) {
        let hostname = config.hostname.clone();
        debug!(proxy = %hostname, "Creating proxy");

        let mesh_provider = match self.resolve_mesh_provider(&config) {
            Ok(provider) => provider,
            Err(e) => {
                error!(proxy = %hostname, error = %e, "Error resolving mesh provider");
                return;
            }
        };

        let endpoint = match mesh_provider.new_endpoint(&config).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(proxy = %hostname, error = %e, "Error creating mesh endpoint");
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let proxy = match Proxy::new(
            config,
            Arc::from(endpoint),
            Box::new(move |event| {
                if let Some(manager) = weak.upgrade() {
                    manager.broadcast(event);
                }
            }),
        ) {
            Ok(proxy) => proxy,
            Err(e) => {
                error!(proxy = %hostname, error = %e, "Error creating proxy");
                return;
            }
        };

        let previous = {
            let mut registry = self.registry.write();
            registry.proxies.insert(hostname.clone(), Arc::clone(&proxy))
        };
        if let Some(previous) = previous {
            warn!(proxy = %hostname, "Replacing existing proxy with the same hostname");
            previous.close().await;
        }

        self.broadcast(ProxyEvent {
            id: hostname,
            status: ProxyStatus::Initializing,
        });

        proxy.start();
    }

    /// Tear down the proxy belonging to the event's target id
    async fn event_stop(&self, event: &TargetEvent) {
        debug!(target_id = %event.id, "Stopping target");

        let proxy = match self.get_proxy_by_target_id(&event.id) {
            Some(proxy) => proxy,
            None => {
                warn!(target_id = %event.id, "No proxy found for target");
                return;
            }
        };

        let provider_name = proxy.config().target_provider.clone();
        if let Some(provider) = self.get_target_provider(&provider_name) {
            if let Err(e) = provider.delete_proxy(&event.id).await {
                error!(target_id = %event.id, error = %e, "Error deleting target from provider");
                return;
            }
        }

        self.remove_proxy(&proxy.config().hostname.clone()).await;
    }

    async fn remove_proxy(&self, hostname: &str) {
        let proxy = match self.get_proxy(hostname) {
            Some(proxy) => proxy,
            None => return,
        };

        proxy.close().await;

        self.registry.write().proxies.remove(hostname);
        debug!(proxy = %hostname, "Removed proxy");
    }

    /// Shut down all proxies concurrently and wait for completion
    pub async fn stop_all_proxies(&self) {
        info!("Shutdown all proxies");

        let proxies: Vec<Arc<Proxy>> = self.registry.read().proxies.values().cloned().collect();

        let closes = proxies.iter().map(|proxy| proxy.close());
        futures::future::join_all(closes).await;

        self.registry.write().proxies.clear();
    }

    /// Close all target providers (each emits Stop for its active targets)
    pub async fn close_target_providers(&self) {
        let providers: Vec<Arc<dyn TargetProvider>> = self
            .registry
            .read()
            .target_providers
            .values()
            .cloned()
            .collect();
        for provider in providers {
            provider.close().await;
        }
    }

    fn get_target_provider(&self, name: &str) -> Option<Arc<dyn TargetProvider>> {
        self.registry.read().target_providers.get(name).cloned()
    }

    fn get_proxy_by_target_id(&self, target_id: &str) -> Option<Arc<Proxy>> {
        // Linear scan: the number of live proxies is expected to be small
        let registry = self.registry.read();
        registry
            .proxies
            .values()
            .find(|p| p.config().target_id == target_id)
            .cloned()
    }

    /// Resolve the mesh provider for a config: explicit name, then the
    /// target provider's default, then the global default
    fn resolve_mesh_provider(
        &self,
        config: &ProxyConfig,
    ) -> Result<Arc<dyn MeshProvider>, Error> {
        let registry = self.registry.read();

        if !config.proxy_provider.is_empty() {
            return registry
                .mesh_providers
                .get(&config.proxy_provider)
                .cloned()
                .ok_or_else(|| Error::ProviderNotFound(config.proxy_provider.clone()));
        }

        if let Some(target_provider) = registry.target_providers.get(&config.target_provider) {
            let default = target_provider.default_proxy_provider_name();
            if !default.is_empty() {
                if let Some(provider) = registry.mesh_providers.get(&default) {
                    return Ok(Arc::clone(provider));
                }
            }
        }

        registry
            .mesh_providers
            .get(&self.default_mesh_provider)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(self.default_mesh_provider.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::EndpointStatus;
    use crate::model::parse_short_port_spec;
    use crate::proxy::testutil::{ScriptedEndpoint, ScriptedProvider};
    use async_trait::async_trait;
    use std::time::Duration;
    use url::Url;

    struct StaticTargetProvider {
        name: String,
        targets: parking_lot::Mutex<HashMap<String, ProxyConfig>>,
        default_mesh: String,
    }

    impl StaticTargetProvider {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                targets: parking_lot::Mutex::new(HashMap::new()),
                default_mesh: String::new(),
            })
        }

        fn insert(&self, id: &str, hostname: &str) {
            let mut config =
                ProxyConfig::new(id.to_string(), hostname.to_string(), self.name.clone());
            let mut port = parse_short_port_spec("80/http").unwrap();
            port.targets.push(Url::parse("http://127.0.0.1:9").unwrap());
            config.ports.insert("80/http".into(), port);
            self.targets.lock().insert(id.to_string(), config);
        }
    }

    #[async_trait]
    impl TargetProvider for StaticTargetProvider {
        async fn watch_events(
            &self,
            events: mpsc::Sender<TargetEvent>,
            _errors: mpsc::Sender<anyhow::Error>,
        ) {
            let ids: Vec<String> = self.targets.lock().keys().cloned().collect();
            let provider = self.name.clone();
            tokio::spawn(async move {
                for id in ids {
                    let _ = events
                        .send(TargetEvent {
                            id,
                            action: TargetAction::Start,
                            provider: provider.clone(),
                        })
                        .await;
                }
            });
        }

        async fn add_target(&self, id: &str) -> anyhow::Result<ProxyConfig> {
            self.targets
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| Error::TargetNotFound(id.to_string()).into())
        }

        async fn delete_proxy(&self, _id: &str) -> anyhow::Result<()> {
            // Bookkeeping only; the target stays materializable, as with the
            // real providers
            Ok(())
        }

        fn default_proxy_provider_name(&self) -> String {
            self.default_mesh.clone()
        }

        async fn close(&self) {}
    }

    fn running_mesh() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider {
            script: vec![
                ScriptedEndpoint::event(EndpointStatus::Starting),
                ScriptedEndpoint::event(EndpointStatus::Running),
            ],
        })
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        let mut waited = Duration::ZERO;
        while !cond() && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert!(cond());
    }

    #[tokio::test]
    async fn test_start_event_registers_proxy_under_hostname() {
        let manager = ProxyManager::new("default".into());
        manager.add_mesh_provider("default", running_mesh());

        let provider = StaticTargetProvider::new("static");
        provider.insert("t1", "web");
        manager.add_target_provider("static", provider);

        manager.watch_events();
        wait_until(|| manager.get_proxy("web").is_some()).await;

        let proxy = manager.get_proxy("web").unwrap();
        assert_eq!(proxy.config().target_id, "t1");

        manager.stop_all_proxies().await;
    }

    #[tokio::test]
    async fn test_stop_event_removes_proxy() {
        let manager = ProxyManager::new("default".into());
        manager.add_mesh_provider("default", running_mesh());

        let provider = StaticTargetProvider::new("static");
        provider.insert("t1", "web");
        manager.add_target_provider("static", Arc::clone(&provider) as Arc<dyn TargetProvider>);

        manager
            .handle_target_event(TargetEvent {
                id: "t1".into(),
                action: TargetAction::Start,
                provider: "static".into(),
            })
            .await;
        assert!(manager.get_proxy("web").is_some());

        manager
            .handle_target_event(TargetEvent {
                id: "t1".into(),
                action: TargetAction::Stop,
                provider: "static".into(),
            })
            .await;
        assert!(manager.get_proxy("web").is_none());
    }

    #[tokio::test]
    async fn test_restart_is_stop_then_start() {
        let manager = ProxyManager::new("default".into());
        manager.add_mesh_provider("default", running_mesh());

        let provider = StaticTargetProvider::new("static");
        provider.insert("t1", "web");
        manager.add_target_provider("static", Arc::clone(&provider) as Arc<dyn TargetProvider>);

        let (sub_id, mut events) = manager.subscribe_status_events();

        manager
            .handle_target_event(TargetEvent {
                id: "t1".into(),
                action: TargetAction::Start,
                provider: "static".into(),
            })
            .await;
        let first = manager.get_proxy("web").unwrap();

        manager
            .handle_target_event(TargetEvent {
                id: "t1".into(),
                action: TargetAction::Restart,
                provider: "static".into(),
            })
            .await;

        let second = manager.get_proxy("web").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // The bus shows a full stop before the second initializing
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.status);
        }
        let stopped_at = seen
            .iter()
            .position(|s| *s == ProxyStatus::Stopped)
            .expect("stop observed");
        let reinit_at = seen
            .iter()
            .rposition(|s| *s == ProxyStatus::Initializing)
            .expect("restart observed");
        assert!(stopped_at < reinit_at);

        manager.unsubscribe_status_events(sub_id);
        manager.stop_all_proxies().await;
    }

    #[tokio::test]
    async fn test_mesh_provider_resolution_order() {
        let manager = ProxyManager::new("global-default".into());
        manager.add_mesh_provider("global-default", running_mesh());
        manager.add_mesh_provider("explicit", running_mesh());

        let provider = StaticTargetProvider::new("static");
        manager.add_target_provider("static", provider);

        // Explicit name wins
        let mut config = ProxyConfig::new("t1".into(), "a".into(), "static".into());
        config.proxy_provider = "explicit".into();
        assert!(manager.resolve_mesh_provider(&config).is_ok());

        // Unknown explicit name fails rather than falling through
        config.proxy_provider = "missing".into();
        assert!(matches!(
            manager.resolve_mesh_provider(&config),
            Err(Error::ProviderNotFound(_))
        ));

        // No explicit name falls back to the global default
        config.proxy_provider = String::new();
        assert!(manager.resolve_mesh_provider(&config).is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_are_lossy_not_blocking() {
        let manager = ProxyManager::new("default".into());
        let (_sub_id, mut events) = manager.subscribe_status_events();

        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            manager.broadcast(ProxyEvent {
                id: format!("p{}", i),
                status: ProxyStatus::Running,
            });
        }

        // The sink capped out; the overflow was dropped, not blocked on
        let mut received = 0;
        while events.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn test_stop_all_proxies() {
        let manager = ProxyManager::new("default".into());
        manager.add_mesh_provider("default", running_mesh());

        let provider = StaticTargetProvider::new("static");
        provider.insert("t1", "a");
        provider.insert("t2", "b");
        manager.add_target_provider("static", provider);

        manager.watch_events();
        wait_until(|| manager.snapshot().len() == 2).await;

        let proxies: Vec<Arc<Proxy>> = manager.snapshot().values().cloned().collect();
        manager.stop_all_proxies().await;

        assert!(manager.snapshot().is_empty());
        for proxy in proxies {
            assert_eq!(proxy.status(), ProxyStatus::Stopped);
        }
    }
}
