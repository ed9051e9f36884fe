//! Per-target proxy aggregate
//!
//! A proxy owns exactly one mesh endpoint and a fixed-at-construction map of
//! port workers, and drives the endpoint's join state into an observable
//! status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mesh::{EndpointStatus, MeshEndpoint};
use crate::model::{ProxyConfig, ProxyEvent, ProxyStatus};
use crate::port::PortWorker;

/// Callback invoked for every status transition
pub type StatusCallback = Box<dyn Fn(ProxyEvent) + Send + Sync>;

pub struct Proxy {
    config: ProxyConfig,
    endpoint: Arc<dyn MeshEndpoint>,
    ports: HashMap<String, Arc<PortWorker>>,

    /// Guards the cached status and the callback invocation so observers see
    /// transitions in causal order
    status: Mutex<ProxyStatus>,
    on_update: StatusCallback,

    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    /// Build the proxy and its port workers. No network work happens here.
    pub fn new(
        config: ProxyConfig,
        endpoint: Arc<dyn MeshEndpoint>,
        on_update: StatusCallback,
    ) -> anyhow::Result<Arc<Self>> {
        let mut ports = HashMap::new();
        for (key, port_config) in &config.ports {
            let worker = PortWorker::new(key, port_config.clone(), config.proxy_access_log)?;
            ports.insert(key.clone(), Arc::new(worker));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            endpoint,
            ports,
            status: Mutex::new(ProxyStatus::Initializing),
            on_update,
            shutdown_tx,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn status(&self) -> ProxyStatus {
        *self.status.lock()
    }

    /// Externally-visible URL of the endpoint once joined
    pub fn url(&self) -> Option<String> {
        self.endpoint.url()
    }

    /// URL a human must visit while the endpoint awaits login
    pub fn auth_url(&self) -> Option<String> {
        self.endpoint.auth_url()
    }

    /// Start the endpoint and its port workers in the background
    pub fn start(self: &Arc<Self>) {
        let proxy = Arc::clone(self);
        let events_task = tokio::spawn(async move {
            proxy.forward_endpoint_events().await;
        });

        let proxy = Arc::clone(self);
        let start_task = tokio::spawn(async move {
            proxy.run().await;
        });

        let mut tasks = self.tasks.lock();
        tasks.push(events_task);
        tasks.push(start_task);
    }

    async fn run(self: &Arc<Self>) {
        info!(proxy = %self.config.hostname, "starting proxy");

        if self.ports.is_empty() {
            warn!(proxy = %self.config.hostname, "No ports configured");
            self.set_status(ProxyStatus::Error);
            return;
        }

        if let Err(e) = self.endpoint.start().await {
            error!(proxy = %self.config.hostname, error = %e, "Error starting mesh endpoint");
            // close() joins this task, so it must run outside of it
            let proxy = Arc::clone(self);
            tokio::spawn(async move { proxy.close().await });
            return;
        }

        for (key, worker) in &self.ports {
            debug!(proxy = %self.config.hostname, port = %key, "Starting proxy port");

            // A single port failing to bind doesn't take the proxy down
            let listener = match self.endpoint.listener(key).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(proxy = %self.config.hostname, port = %key, error = %e, "Error adding listener");
                    continue;
                }
            };

            let proxy = Arc::clone(self);
            let worker = Arc::clone(worker);
            let handle = tokio::spawn(async move {
                let endpoint = Arc::clone(&proxy.endpoint);
                if let Err(e) = worker.serve(listener, endpoint).await {
                    error!(proxy = %proxy.config.hostname, port = %worker.key(), error = %e, "error serving port");
                    proxy.set_status(ProxyStatus::Error);
                }
            });
            self.tasks.lock().push(handle);
        }
    }

    /// Translate endpoint join-state events into proxy status transitions
    async fn forward_endpoint_events(self: &Arc<Self>) {
        let mut events = match self.endpoint.take_events() {
            Some(events) => events,
            None => return,
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // A close that raced this subscription won't trigger changed()
        if *shutdown_rx.borrow() {
            return;
        }
        let mut seen_running = false;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => break,
                    };

                    match event.status {
                        EndpointStatus::Starting => self.set_status(ProxyStatus::Starting),
                        EndpointStatus::NeedsLogin => self.set_status(ProxyStatus::Authenticating),
                        EndpointStatus::Running => {
                            self.set_status(ProxyStatus::Running);
                            if !seen_running {
                                seen_running = true;
                                self.endpoint.prefetch_tls_certificates().await;
                            }
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Close the proxy: cancel its context, close every port worker, close
    /// the endpoint. Idempotent; concurrent callers beyond the first return
    /// immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(proxy = %self.config.hostname, "stopping proxy");
        self.set_status(ProxyStatus::Stopping);

        let _ = self.shutdown_tx.send(true);

        for worker in self.ports.values() {
            worker.close();
        }

        if let Err(e) = self.endpoint.close().await {
            error!(proxy = %self.config.hostname, error = %e, "Error stopping mesh endpoint");
        }

        // Wait for port workers to drain and background tasks to finish
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.set_status(ProxyStatus::Stopped);
        info!(proxy = %self.config.hostname, "proxy stopped");
    }

    /// Record a transition and publish it. Idempotent re-entries are
    /// suppressed. The lock is held across the callback so a subscriber
    /// never observes transitions out of order.
    fn set_status(&self, status: ProxyStatus) {
        let mut current = self.status.lock();
        if *current == status {
            return;
        }
        *current = status;

        (self.on_update)(ProxyEvent {
            id: self.config.hostname.clone(),
            status,
        });
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::mesh::{EndpointEvent, EndpointStatus, MeshEndpoint, MeshListener, MeshProvider};
    use crate::model::{Identity, ProxyConfig};

    /// Scripted endpoint for tests: plays back a fixed event sequence and
    /// binds plain loopback listeners
    pub struct ScriptedEndpoint {
        script: Vec<EndpointEvent>,
        events: Mutex<Option<mpsc::Receiver<EndpointEvent>>>,
        events_tx: Mutex<Option<mpsc::Sender<EndpointEvent>>>,
        url: Mutex<Option<String>>,
        auth_url: Mutex<Option<String>>,
        pub whois: Identity,
        pub fail_start: bool,
    }

    impl ScriptedEndpoint {
        pub fn new(script: Vec<EndpointEvent>) -> Self {
            let (tx, rx) = mpsc::channel(16);
            Self {
                script,
                events: Mutex::new(Some(rx)),
                events_tx: Mutex::new(Some(tx)),
                url: Mutex::new(None),
                auth_url: Mutex::new(None),
                whois: Identity::default(),
                fail_start: false,
            }
        }

        pub fn event(status: EndpointStatus) -> EndpointEvent {
            EndpointEvent {
                status,
                auth_url: None,
                dns_name: None,
            }
        }
    }

    #[async_trait]
    impl MeshEndpoint for ScriptedEndpoint {
        async fn start(&self) -> anyhow::Result<()> {
            if self.fail_start {
                anyhow::bail!("scripted start failure");
            }
            let tx = self.events_tx.lock().take();
            if let Some(tx) = tx {
                for event in self.script.clone() {
                    if let Some(auth_url) = &event.auth_url {
                        *self.auth_url.lock() = Some(auth_url.clone());
                    }
                    if let Some(dns_name) = &event.dns_name {
                        *self.url.lock() = Some(format!("https://{}", dns_name));
                    }
                    let _ = tx.send(event).await;
                }
            }
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn listener(&self, _port_key: &str) -> anyhow::Result<MeshListener> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            Ok(MeshListener::Plain(listener))
        }

        fn take_events(&self) -> Option<mpsc::Receiver<EndpointEvent>> {
            self.events.lock().take()
        }

        fn url(&self) -> Option<String> {
            self.url.lock().clone()
        }

        fn auth_url(&self) -> Option<String> {
            self.auth_url.lock().clone()
        }

        async fn whois(&self, _remote: SocketAddr) -> Identity {
            self.whois.clone()
        }

        async fn prefetch_tls_certificates(&self) {}
    }

    /// Provider that hands out scripted endpoints
    pub struct ScriptedProvider {
        pub script: Vec<EndpointEvent>,
    }

    #[async_trait]
    impl MeshProvider for ScriptedProvider {
        async fn new_endpoint(
            &self,
            _config: &ProxyConfig,
        ) -> anyhow::Result<Box<dyn MeshEndpoint>> {
            Ok(Box::new(ScriptedEndpoint::new(self.script.clone())))
        }
    }
}
