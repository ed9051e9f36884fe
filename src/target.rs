//! Target provider contract
//!
//! A target provider discovers the units a proxy should exist for and emits
//! lifecycle events keyed by target id. Events for a single id are emitted
//! serially; the manager relies on that for per-target ordering.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::ProxyConfig;

/// What the manager should do for a target id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    Start,
    Stop,
    Restart,
}

/// Event emitted by a target provider
#[derive(Debug, Clone)]
pub struct TargetEvent {
    /// Target id, unique within the emitting provider
    pub id: String,
    pub action: TargetAction,
    /// Name of the provider that emitted the event
    pub provider: String,
}

#[async_trait]
pub trait TargetProvider: Send + Sync {
    /// Start watching the underlying source. Emits a `Start` event for every
    /// target currently present, then translates source changes into events
    /// until the provider is closed. Watcher setup happens here; the method
    /// returns once watching is established (not when it ends). Terminal
    /// watcher failures surface on `errors`.
    async fn watch_events(
        &self,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<anyhow::Error>,
    );

    /// Materialize the normalized proxy config for a current target
    async fn add_target(&self, id: &str) -> anyhow::Result<ProxyConfig>;

    /// The manager tore down the proxy for `id`; drop any bookkeeping
    async fn delete_proxy(&self, id: &str) -> anyhow::Result<()>;

    /// Mesh provider to use for targets that don't name one; empty when the
    /// provider has no opinion
    fn default_proxy_provider_name(&self) -> String;

    /// Terminate the watcher and emit `Stop` for all still-active ids
    async fn close(&self);
}
