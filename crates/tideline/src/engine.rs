//! A complete engine wired from a configuration directory.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::Result;
use crate::gitops::cluster::ClusterApi;
use crate::gitops::git::GitSource;
use crate::gitops::loader::{ConfigLoader, LoadedConfig};
use crate::gitops::reconciler::Reconciler;
use crate::gitops::source::{DirectorySource, SourceBackend, SourceRouter};
use crate::gitops::sync_scheduler::SyncScheduler;
use crate::gitops::watcher::{ChangeNotifier, SourceChangeEvent};

/// URL prefix of local directory sources.
pub const FILE_URL_PREFIX: &str = "file://";

/// Git for remote URLs, plain directories for `file://` URLs.
pub fn default_source(config: &LoadedConfig) -> Arc<dyn SourceBackend> {
    let git = GitSource::new(config.settings.repository_cache_dir.clone())
        .with_repositories(config.repository_resources());
    Arc::new(SourceRouter::new(Arc::new(git)).route(FILE_URL_PREFIX, Arc::new(DirectorySource::new())))
}

pub struct Engine {
    reconciler: Arc<Reconciler>,
    scheduler: SyncScheduler,
    notifiers: Vec<ChangeNotifier>,
}

impl Engine {
    /// Loads `config_dir` and registers every Application in it.
    pub fn load(config_dir: impl AsRef<Path>, cluster: Arc<dyn ClusterApi>) -> Result<Self> {
        let config = ConfigLoader::new(config_dir.as_ref()).load()?;
        let source = default_source(&config);
        Self::with_source(config, source, cluster)
    }

    pub fn with_source(
        config: LoadedConfig,
        source: Arc<dyn SourceBackend>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Result<Self> {
        let reconciler = Arc::new(Reconciler::new(config.settings, source, cluster));
        for app in config.applications {
            reconciler.register(app.resource)?;
        }
        let scheduler = SyncScheduler::new(Arc::clone(&reconciler));
        Ok(Self {
            reconciler,
            scheduler,
            notifiers: Vec::new(),
        })
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Starts the per-Application loops and watches local sources for
    /// changes. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        self.scheduler.start();

        let local: BTreeSet<String> = self
            .reconciler
            .applications()
            .iter()
            .filter_map(|name| self.reconciler.application(name))
            .map(|app| app.spec.source.repo_url)
            .filter(|url| url.starts_with(FILE_URL_PREFIX))
            .collect();
        if local.is_empty() {
            return;
        }

        let (tx, rx) = broadcast::channel::<SourceChangeEvent>(100);
        for url in local {
            let mut notifier = ChangeNotifier::new(url).with_sender(tx.clone());
            notifier.start();
            self.notifiers.push(notifier);
        }
        self.scheduler.watch_sources(rx);
    }

    /// Stops watching and waits for running cycles to finish.
    pub async fn shutdown(&mut self) {
        for notifier in &mut self.notifiers {
            notifier.stop();
        }
        self.notifiers.clear();
        self.scheduler.stop();
        self.scheduler.join().await;
        log::info!("Engine stopped");
    }
}
