//! Host identity: fingerprint acquisition, the local known-hosts file and
//! the reset path used after a server has been reprovisioned.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;

use crate::errors::{Error, Result};
use crate::registry::{ServerDefinition, ServerRegistry};
use crate::ssh::Ssh;
use crate::store::{HostState, ProjectState, Store};

/// Only ed25519 host keys are trusted.
pub const KEY_ALGORITHM: &str = "ssh-ed25519";

/// Extract the single ed25519 key from `ssh-keyscan` output.
pub fn parse_keyscan(output: &str) -> std::result::Result<String, String> {
    let mut keys: Vec<&str> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[1] == KEY_ALGORITHM {
            if !keys.contains(&fields[2]) {
                keys.push(fields[2]);
            }
        }
    }
    match keys.as_slice() {
        [key] => Ok(key.to_string()),
        [] => Err(format!("no {} key presented", KEY_ALGORITHM)),
        _ => Err(format!("{} different {} keys presented", keys.len(), KEY_ALGORITHM)),
    }
}

/// The operator's OpenSSH known-hosts file, restricted to plain (unhashed)
/// `<host> ssh-ed25519 <key>` records written by this tool.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn line_matches(line: &str, host: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return false;
        }
        let mut fields = trimmed.split_whitespace();
        let mut hosts = fields.next().unwrap_or_default();
        if hosts.starts_with('@') {
            hosts = fields.next().unwrap_or_default();
        }
        let bracketed = format!("[{}]:", host);
        hosts
            .split(',')
            .any(|h| h == host || h.starts_with(&bracketed))
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Records currently trusted for `host`.
    pub fn records_for(&self, host: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .lines()
            .filter(|l| Self::line_matches(l, host))
            .map(str::to_string)
            .collect())
    }

    /// Replace whatever is recorded for `host` with exactly one ed25519 record.
    pub fn sync(&self, host: &str, fingerprint: &str) -> Result<()> {
        let record = format!("{} {} {}", host, KEY_ALGORITHM, fingerprint);
        if self.records_for(host)? == [record.as_str()] {
            return Ok(());
        }

        let mut content: String = self
            .read()?
            .lines()
            .filter(|l| !Self::line_matches(l, host))
            .map(|l| format!("{}\n", l))
            .collect();
        content.push_str(&record);
        content.push('\n');

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, content)?;
        Ok(())
    }
}

pub struct TrustManager {
    registry: ServerRegistry,
    project: Arc<dyn Store<ProjectState>>,
    host: Arc<dyn Store<HostState>>,
    ssh: Arc<dyn Ssh>,
    known_hosts: KnownHosts,
}

impl TrustManager {
    pub fn new(
        project: Arc<dyn Store<ProjectState>>,
        host: Arc<dyn Store<HostState>>,
        ssh: Arc<dyn Ssh>,
        known_hosts: KnownHosts,
    ) -> Self {
        Self {
            registry: ServerRegistry::new(host.clone()),
            project,
            host,
            ssh,
            known_hosts,
        }
    }

    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    /// Ask `host` for its ed25519 key. Never returns an empty fingerprint.
    pub async fn fetch_fingerprint(&self, host: &str) -> Result<String> {
        o_detail!("   Getting ed25519 fingerprint of {}...", host.cyan());
        let output = self
            .ssh
            .scan_host_key(host)
            .await
            .map_err(|e| Error::FingerprintUnavailable {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        parse_keyscan(&output).map_err(|reason| Error::FingerprintUnavailable {
            host: host.to_string(),
            reason,
        })
    }

    pub fn sync_known_hosts(&self, host: &str, fingerprint: &str) -> Result<()> {
        self.known_hosts.sync(host, fingerprint)
    }

    /// Forget everything learned about a server and trust its current key.
    ///
    /// Clears its control-server bootstrap flag (host-global) and every
    /// "control key copied" flag for it (project), then re-fetches the
    /// fingerprint, stores it in the registry and rewrites the known-hosts
    /// record.
    pub async fn reset_server(&self, server_key: &str) -> Result<ServerDefinition> {
        let server = self.registry.resolve(server_key)?;
        let id = server.unique_id.clone();

        self.host.update(|state| {
            if let Some(flag) = state.control_server_init.get_mut(&id) {
                *flag = false;
            }
        })?;
        self.project
            .update(|state| state.clear_key_copied_for_server(&id))?;

        let address = server.preferred_host()?.to_string();
        let fingerprint = self.fetch_fingerprint(&address).await?;
        self.registry.set_fingerprint(&id, &fingerprint)?;
        self.sync_known_hosts(&address, &fingerprint)?;

        o_success!(
            "   {} {} reset, now trusting {}",
            "✔".green(),
            server.describe(),
            fingerprint.dimmed()
        );

        Ok(ServerDefinition {
            fingerprint,
            ..server
        })
    }
}
