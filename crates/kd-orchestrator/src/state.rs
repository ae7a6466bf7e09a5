//! Application context

use std::sync::Arc;
use std::time::Duration;

use kd_core::config::DaemonConfig;
use kd_core::traits::{EventBus, ImageInspector, MemoryStore, MetadataStore};

use crate::cluster::Cluster;
use crate::deploy::Orchestrator;
use crate::exec::RemoteStreams;
use crate::reaper::Reaper;

/// Everything a request handler needs, built once at startup
pub struct AppContext {
    pub config: DaemonConfig,
    pub store: Arc<dyn MetadataStore>,
    pub events: Arc<EventBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub streams: Arc<RemoteStreams>,
    pub reaper: Arc<Reaper>,
}

impl AppContext {
    /// Build the context with an in-memory store and a fresh event bus
    pub fn new(config: DaemonConfig, cluster: Arc<dyn Cluster>, images: Arc<dyn ImageInspector>) -> Self {
        Self::builder(config, cluster, images).build()
    }

    pub fn builder(config: DaemonConfig, cluster: Arc<dyn Cluster>, images: Arc<dyn ImageInspector>) -> AppContextBuilder {
        AppContextBuilder {
            config,
            cluster,
            images,
            store: None,
            poll_interval: None,
            reap_interval: None,
        }
    }
}

/// Builder for [`AppContext`], mainly to shorten intervals in tests
pub struct AppContextBuilder {
    config: DaemonConfig,
    cluster: Arc<dyn Cluster>,
    images: Arc<dyn ImageInspector>,
    store: Option<Arc<dyn MetadataStore>>,
    poll_interval: Option<Duration>,
    reap_interval: Option<Duration>,
}

impl AppContextBuilder {
    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    pub fn build(self) -> AppContext {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn MetadataStore>);
        let events = Arc::new(EventBus::default());

        let mut orchestrator = Orchestrator::new(
            Arc::clone(&self.cluster),
            Arc::clone(&store),
            events.clone(),
            self.images,
            self.config.clone(),
        );
        if let Some(interval) = self.poll_interval {
            orchestrator = orchestrator.with_poll_interval(interval);
        }
        let orchestrator = Arc::new(orchestrator);

        let streams = Arc::new(RemoteStreams::new(
            Arc::clone(&self.cluster),
            Arc::clone(&store),
            events.clone(),
        ));

        let mut reaper = Reaper::new(Arc::clone(&orchestrator), Arc::clone(&store), self.config.reaper_max_age);
        if let Some(interval) = self.reap_interval {
            reaper = reaper.with_interval(interval);
        }

        AppContext {
            config: self.config,
            store,
            events,
            orchestrator,
            streams,
            reaper: Arc::new(reaper),
        }
    }
}
