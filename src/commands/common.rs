use crate::config::{self, ProjectConfig, Settings};
use crate::orchestrator::Orchestrator;
use crate::registry::ServerRegistry;
use crate::release::ReleaseBuilder;
use crate::ssh::{OpenSsh, Ssh};
use crate::store::{HostState, JsonFileStore, ProjectState, Store};
use crate::trust::{KnownHosts, TrustManager};
use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// What every command works against: the project in the current directory,
/// both state documents and the resolved settings.
pub struct Context {
    pub project_dir: PathBuf,
    pub config: ProjectConfig,
    pub project: Arc<dyn Store<ProjectState>>,
    pub host: Arc<dyn Store<HostState>>,
    pub settings: Settings,
}

impl Context {
    pub fn load() -> Result<Self> {
        let project_dir =
            std::env::current_dir().context("Cannot determine the current directory")?;
        let config = config::load_project_config(&project_dir)
            .with_context(|| format!("Invalid {}", config::PROJECT_CONFIG_FILE))?;

        let global_path = config::global_store_path()?;
        let host: Arc<dyn Store<HostState>> = Arc::new(JsonFileStore::new(&global_path));
        let project: Arc<dyn Store<ProjectState>> =
            Arc::new(JsonFileStore::new(config::project_store_path(&project_dir)));

        let host_state = host
            .load()
            .with_context(|| format!("Cannot read {}", global_path.display()))?;
        let settings = Settings::resolve(&project_dir, &config, &host_state)?;

        Ok(Self {
            project_dir,
            config,
            project,
            host,
            settings,
        })
    }

    pub fn registry(&self) -> ServerRegistry {
        ServerRegistry::new(self.host.clone())
    }

    pub fn ssh(&self) -> Arc<dyn Ssh> {
        Arc::new(OpenSsh::new(
            self.settings.ssh_key.clone(),
            self.settings.known_hosts.clone(),
        ))
    }

    pub fn known_hosts(&self) -> KnownHosts {
        KnownHosts::new(&self.settings.known_hosts)
    }

    pub fn trust(&self) -> TrustManager {
        TrustManager::new(
            self.project.clone(),
            self.host.clone(),
            self.ssh(),
            self.known_hosts(),
        )
    }

    pub fn release_builder(&self) -> Result<ReleaseBuilder> {
        let releases = self.settings.release_root(self.project.as_ref())?;
        Ok(ReleaseBuilder::new(
            &self.project_dir,
            releases,
            self.project.clone(),
        ))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.project.clone(),
            self.host.clone(),
            self.ssh(),
            self.known_hosts(),
        )
    }
}
