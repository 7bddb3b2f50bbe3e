use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::registry::{ServerDefinition, ServerRegistry};
use crate::ssh::RetryPolicy;
use crate::store::{HostState, ProjectState, Store};
use crate::utils::{name_from_dir, validate_name};

pub const PROJECT_CONFIG_FILE: &str = "appctl.toml";
pub const LOCAL_DATA_DIR: &str = ".appctl";

const CONFIG_DIR: &str = "appctl";
const GLOBAL_STORE_FILE: &str = "global.json";
const PROJECT_STORE_FILE: &str = "database.json";
const DEFAULT_SSH_KEY: &str = ".ssh/id_ed25519";
const DEFAULT_KNOWN_HOSTS: &str = ".ssh/known_hosts";
const DEFAULT_TRANSFER_RETRY_DELAY: &str = "1s";

pub const ENV_SSH_KEY: &str = "APPCTL_SSH_KEY";
pub const ENV_SCRIPTS_DIR: &str = "APPCTL_SCRIPTS_DIR";
pub const ENV_KNOWN_HOSTS: &str = "APPCTL_KNOWN_HOSTS";

/// `appctl.toml`
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct ProjectConfig {
    pub name: Option<String>,
    pub email: Option<String>,
    pub master_server: Option<String>,
    pub ssh_key: Option<String>,
    pub release_dir: Option<String>,
    pub scripts_dir: Option<String>,
    /// e.g. "1s", "500ms"
    pub transfer_retry_delay: Option<String>,
    /// Retries after a failed transfer; unset retries until it succeeds
    pub transfer_retries: Option<u32>,
    pub letsencrypt: Option<toml::Table>,
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploymentConfig>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct DeploymentConfig {
    pub master_server: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerRole>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerRole {
    /// ipv4, ipv6, hostname or uniqueId of a registered server
    pub server: String,
    #[serde(default)]
    pub apps: Vec<AppRole>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AppRole {
    pub app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_path: Option<String>,
}

/// Read `appctl.toml` from `dir`. A project without one gets the defaults.
pub fn load_project_config(dir: &Path) -> Result<ProjectConfig> {
    let path = dir.join(PROJECT_CONFIG_FILE);
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }
    let content = fs::read_to_string(&path)?;
    let config: ProjectConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl ProjectConfig {
    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name("project", name)?;
        }
        if let Some(le) = &self.letsencrypt {
            for key in ["dns_hook", "env"] {
                if !le.contains_key(key) {
                    return Err(Error::Config(format!(
                        "No {} in the [letsencrypt] block of {}",
                        key, PROJECT_CONFIG_FILE
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One server of a validated target, resolved against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedServer {
    /// The key as written in appctl.toml
    pub key: String,
    pub definition: ServerDefinition,
    pub apps: Vec<AppRole>,
}

#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub name: String,
    pub servers: Vec<ResolvedServer>,
    pub master_server: Option<String>,
}

fn valid_web_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/')
}

/// Validate one deploy target and resolve its servers.
pub fn validate_target(
    config: &ProjectConfig,
    target: &str,
    registry: &ServerRegistry,
) -> Result<DeployTarget> {
    validate_name("target", target)?;
    let deployment = config.deployments.get(target).ok_or_else(|| {
        Error::Config(format!(
            "Deploy target \"{}\" is not defined in {}",
            target, PROJECT_CONFIG_FILE
        ))
    })?;
    if deployment.servers.is_empty() {
        return Err(Error::Config(format!(
            "Deploy target \"{}\" has no servers",
            target
        )));
    }

    let mut seen_servers = HashSet::new();
    let mut servers = Vec::with_capacity(deployment.servers.len());

    for role in &deployment.servers {
        let mut app_names = HashSet::new();
        for app in &role.apps {
            validate_name("app", &app.app)?;
            if !app_names.insert(app.app.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate app {} in the block for server {}",
                    app.app, role.server
                )));
            }
            if let Some(path) = &app.web_path {
                if !valid_web_path(path) {
                    return Err(Error::Config(format!(
                        "web_path contains an invalid character: {}",
                        path
                    )));
                }
            }
        }

        let definition = registry.resolve(&role.server)?;
        if !seen_servers.insert(definition.unique_id.clone()) {
            return Err(Error::Config(format!(
                "Server {} is listed more than once in target \"{}\"",
                role.server, target
            )));
        }
        servers.push(ResolvedServer {
            key: role.server.clone(),
            definition,
            apps: role.apps.clone(),
        });
    }

    Ok(DeployTarget {
        name: target.to_string(),
        servers,
        master_server: deployment.master_server.clone(),
    })
}

pub fn global_store_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not find config directory".into()))?
        .join(CONFIG_DIR);
    Ok(dir.join(GLOBAL_STORE_FILE))
}

pub fn project_store_path(project_dir: &Path) -> PathBuf {
    project_dir.join(LOCAL_DATA_DIR).join(PROJECT_STORE_FILE)
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| Error::Config("Could not find home directory".into()))
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Everything a command needs to know about where things live, resolved
/// from the environment, appctl.toml and the global settings, in that order.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_dir: PathBuf,
    /// `name` from appctl.toml; see [`Settings::project_name`]
    configured_name: Option<String>,
    pub email: Option<String>,
    /// Project-wide, else global, control-server default
    pub master_server: Option<String>,
    pub ssh_key: PathBuf,
    pub known_hosts: PathBuf,
    pub scripts_dir: PathBuf,
    /// Shared release directory, when releases are kept outside the project
    pub external_release_dir: Option<PathBuf>,
    pub keys_dir: PathBuf,
    pub letsencrypt: Option<toml::Table>,
    pub transfer_retry: RetryPolicy,
}

impl Settings {
    pub fn resolve(project_dir: &Path, config: &ProjectConfig, host: &HostState) -> Result<Self> {
        Self::resolve_with(project_dir, config, host, |key| {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        })
    }

    pub fn resolve_with(
        project_dir: &Path,
        config: &ProjectConfig,
        host: &HostState,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let home = home_dir()?;

        let ssh_key = match (env(ENV_SSH_KEY), &config.ssh_key, &host.ssh_key) {
            (Some(p), _, _) => expand(&p),
            (None, Some(p), _) => expand(p),
            (None, None, Some(p)) => {
                let p = expand(p);
                if p.is_absolute() {
                    p
                } else {
                    home.join(p)
                }
            }
            (None, None, None) => home.join(DEFAULT_SSH_KEY),
        };

        let known_hosts = env(ENV_KNOWN_HOSTS)
            .map(|p| expand(&p))
            .unwrap_or_else(|| home.join(DEFAULT_KNOWN_HOSTS));

        let scripts_dir = match env(ENV_SCRIPTS_DIR)
            .or_else(|| config.scripts_dir.clone())
            .or_else(|| host.scripts_dir.clone())
        {
            Some(p) => expand(&p),
            None => dirs::data_dir()
                .ok_or_else(|| Error::Config("Could not find data directory".into()))?
                .join(CONFIG_DIR)
                .join("remote-scripts"),
        };

        let local_data = project_dir.join(LOCAL_DATA_DIR);
        let external_release_dir = config
            .release_dir
            .as_ref()
            .or(host.release_dir.as_ref())
            .map(|dir| expand(dir));

        let delay = config
            .transfer_retry_delay
            .as_deref()
            .unwrap_or(DEFAULT_TRANSFER_RETRY_DELAY);
        let delay: Duration = humantime::parse_duration(delay).map_err(|e| {
            Error::Config(format!("Invalid transfer_retry_delay \"{}\": {}", delay, e))
        })?;
        let transfer_retry = match config.transfer_retries {
            None => RetryPolicy::Forever { delay },
            Some(0) => RetryPolicy::Never,
            Some(retries) => RetryPolicy::Limited {
                attempts: retries.saturating_add(1),
                delay,
            },
        };

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            configured_name: config.name.clone(),
            email: config.email.clone().or_else(|| host.email.clone()),
            master_server: config
                .master_server
                .clone()
                .or_else(|| host.master_server.clone()),
            ssh_key,
            known_hosts,
            scripts_dir,
            external_release_dir,
            keys_dir: local_data.join("keys"),
            letsencrypt: config.letsencrypt.clone(),
            transfer_retry,
        })
    }

    /// Only commands working on the project itself need a valid name, so
    /// it is checked here rather than when the settings are resolved.
    pub fn project_name(&self) -> Result<String> {
        match &self.configured_name {
            Some(name) => validate_name("project", name),
            None => validate_name("project", &name_from_dir(&self.project_dir)),
        }
    }

    /// Private half of a target's control keypair; the public half is `<path>.pub`.
    pub fn control_key_path(&self, target: &str) -> PathBuf {
        self.keys_dir.join(target)
    }

    /// Directory holding this project's `release-<n>` trees. A shared
    /// release directory is split per project by name and a project id
    /// generated on first use.
    pub fn release_root(&self, project_store: &dyn Store<ProjectState>) -> Result<PathBuf> {
        let Some(dir) = &self.external_release_dir else {
            return Ok(self.project_dir.join(LOCAL_DATA_DIR).join("releases"));
        };
        let unique_id = project_store.update(|state| {
            state
                .project_unique_id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone()
        })?;
        let prefix: String = self.project_name()?.chars().take(12).collect();
        Ok(dir.join(format!("{}-{}", prefix, unique_id)))
    }
}
