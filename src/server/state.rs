use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Settings;
use crate::locks::KeyedLocks;
use crate::metrics::{MetricsSnapshot, Sampler};
use crate::rules::{RuleManager, RuleStore};
use crate::runtime::{CommandExecutor, DockerCli, LifecycleManager, TrafficManager};
use crate::store::Store;
use crate::sync::Reconciler;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub reconciler: Reconciler,
    pub rules: RuleManager,
    pub traffic: TrafficManager,
    pub metrics: watch::Receiver<Arc<MetricsSnapshot>>,
}

impl AppState {
    /// Wire every component onto one executor. The metrics feed starts
    /// empty until [`AppState::with_metrics`] attaches a sampler.
    pub fn new(
        settings: Settings,
        store: Arc<Store>,
        records: Arc<RuleStore>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let docker = DockerCli::new(executor, settings.docker_bin.clone(), settings.command_timeout());
        let lifecycle = LifecycleManager::new(docker.clone(), &settings);
        let router = lifecycle.router().clone();
        let device_locks = KeyedLocks::new();

        let rules = RuleManager::new(
            store.clone(),
            records,
            router.clone(),
            device_locks.clone(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            lifecycle,
            rules.clone(),
            device_locks,
            settings.max_parallel_ops,
        );
        let traffic = TrafficManager::new(docker, router, settings.iperf_base_port);
        let (_, metrics) = watch::channel(Arc::new(MetricsSnapshot::empty()));

        Self {
            settings: Arc::new(settings),
            store,
            reconciler,
            rules,
            traffic,
            metrics,
        }
    }

    pub fn with_metrics(mut self, metrics: watch::Receiver<Arc<MetricsSnapshot>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// A sampler reading the same store and shaping endpoint as the API
    pub fn sampler(&self) -> Sampler {
        Sampler::new(
            self.store.clone(),
            self.reconciler.lifecycle().router().clone(),
            self.settings.sample_timeout(),
        )
    }
}
