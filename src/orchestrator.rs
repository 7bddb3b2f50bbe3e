//! Deploy orchestrator: drives one deploy of one target through its control
//! server.
//!
//! The operator's machine only ever talks to the control server. It makes
//! sure every server of the target trusts the target's control key, ships
//! the scripts and a bundle (config, control key, referenced apps) to the
//! control server and asks it to roll the release out to the others.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;

use crate::config::{validate_target, AppRole, DeployTarget, ProjectConfig, ResolvedServer};
use crate::errors::{Error, Result};
use crate::registry::{ServerDefinition, ServerRegistry};
use crate::ssh::{public_key_path, sync_with_retry, RemoteHost, RetryPolicy, ScriptOutput, Ssh, TransportError};
use crate::store::{HostState, ProjectState, Store};
use crate::trust::{KnownHosts, TrustManager};
use crate::utils::{copy_dir, deployment_name};

/// Directories on the control server, relative to the remote user's home.
pub const REMOTE_SCRIPTS_DIR: &str = "appctl-master-scripts";
pub const REMOTE_DEPLOYMENTS_DIR: &str = "appctl-master-deployments";

pub const INIT_SCRIPT: &str = "control_init.py";
pub const DEPLOY_SCRIPT: &str = "control_deploy.py";

/// Bundle layout: `<deployment>/{appctl.json, control-key, apps/<app>/...}`
pub const BUNDLE_CONFIG_FILE: &str = "appctl.json";
pub const BUNDLE_CONTROL_KEY: &str = "control-key";
pub const BUNDLE_APPS_DIR: &str = "apps";

const REMOTE_OUTPUT_PREFIX: &str = "   remote says: ";

/// Everything about one deploy that does not come from the target itself.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub project_name: String,
    pub email: String,
    pub release_number: u64,
    pub release_dir: PathBuf,
    /// Private half of the target's control keypair
    pub control_key: PathBuf,
    pub scripts_dir: PathBuf,
    /// Project or global default, used when the target names no master server
    pub default_master_server: Option<String>,
    pub letsencrypt: Option<toml::Table>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapStatus {
    AlreadyDone,
    Completed,
    /// Logged and skipped; the deploy went on without it.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub deployment: String,
    pub release: u64,
    pub control_server: ServerDefinition,
    pub keypair_generated: bool,
    /// Addresses the control key was installed on during this run
    pub keys_installed: Vec<String>,
    pub bootstrap: BootstrapStatus,
    pub apps: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BundleApp<'a> {
    app: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_path: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BundleServer<'a> {
    unique_id: &'a str,
    ip: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv4: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv6: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
    fingerprint: &'a str,
    apps: Vec<BundleApp<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BundleConfig<'a> {
    project: &'a str,
    target: &'a str,
    deployment: &'a str,
    release: u64,
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    letsencrypt: Option<&'a toml::Table>,
    master_server: BundleServer<'a>,
    servers: Vec<BundleServer<'a>>,
}

fn bundle_server<'a>(definition: &'a ServerDefinition, apps: &'a [AppRole]) -> Result<BundleServer<'a>> {
    Ok(BundleServer {
        unique_id: &definition.unique_id,
        ip: definition.preferred_host()?,
        ipv4: definition.ipv4.as_deref(),
        ipv6: definition.ipv6.as_deref(),
        hostname: definition.hostname.as_deref(),
        fingerprint: &definition.fingerprint,
        apps: apps
            .iter()
            .map(|a| BundleApp {
                app: &a.app,
                domain: a.domain.as_deref(),
                web_path: a.web_path.as_deref(),
            })
            .collect(),
    })
}

fn remote_host(definition: &ServerDefinition) -> Result<RemoteHost> {
    Ok(RemoteHost {
        address: definition.preferred_host()?.to_string(),
        fingerprint: definition.fingerprint.clone(),
    })
}

/// Union of the apps of every server, in first-seen order.
pub fn referenced_apps(servers: &[ResolvedServer]) -> Vec<String> {
    let mut seen = HashSet::new();
    servers
        .iter()
        .flat_map(|s| s.apps.iter())
        .filter(|a| seen.insert(a.app.as_str()))
        .map(|a| a.app.clone())
        .collect()
}

fn print_remote_output(output: &ScriptOutput) {
    crate::output::print_lines(&output.stdout, REMOTE_OUTPUT_PREFIX);
    crate::output::print_lines(&output.stderr, REMOTE_OUTPUT_PREFIX);
}

pub struct Orchestrator {
    registry: ServerRegistry,
    trust: TrustManager,
    project: Arc<dyn Store<ProjectState>>,
    host: Arc<dyn Store<HostState>>,
    ssh: Arc<dyn Ssh>,
    bundle_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        project: Arc<dyn Store<ProjectState>>,
        host: Arc<dyn Store<HostState>>,
        ssh: Arc<dyn Ssh>,
        known_hosts: KnownHosts,
    ) -> Self {
        Self {
            registry: ServerRegistry::new(host.clone()),
            trust: TrustManager::new(project.clone(), host.clone(), ssh.clone(), known_hosts),
            project,
            host,
            ssh,
            bundle_root: std::env::temp_dir(),
        }
    }

    #[cfg(test)]
    pub fn with_bundle_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundle_root = dir.into();
        self
    }

    pub async fn deploy(
        &self,
        config: &ProjectConfig,
        target: &str,
        opts: &DeployOptions,
    ) -> Result<DeployReport> {
        // 1. resolve
        let mut target = validate_target(config, target, &self.registry)?;
        let deployment = deployment_name(&opts.project_name, &target.name)?;
        o_step!(
            "{} release {} to {}...",
            "🚀 Deploying".cyan(),
            opts.release_number.to_string().green(),
            target.name.cyan()
        );

        // 2. trust drift
        self.check_drift(&mut target).await?;

        // 3. control server
        let control = self.select_control_server(&target, opts)?;
        let control_host = remote_host(&control)?;
        o_detail!("   Control server: {}", control.describe().cyan());

        // 4. + 5. control keypair
        o_step!("\n{}", "🔑 Checking control keys...".cyan());
        let keypair_generated = self.ensure_control_keypair(&target.name, &opts.control_key).await?;
        let keys_installed = self
            .distribute_control_key(&target, &public_key_path(&opts.control_key))
            .await?;

        // 6. scripts
        o_step!("\n{}", "🛠  Checking control server...".cyan());
        if !opts.scripts_dir.is_dir() {
            return Err(Error::Config(format!(
                "Remote scripts directory {} not found",
                opts.scripts_dir.display()
            )));
        }
        let scripts = [format!("{}/", opts.scripts_dir.display())];
        sync_with_retry(self.ssh.as_ref(), &control_host, &scripts, REMOTE_SCRIPTS_DIR, opts.retry).await?;

        // 7. bootstrap
        let bootstrap = self.bootstrap(&control, &control_host, &opts.email).await?;

        // 8. + 9. bundle
        let apps = referenced_apps(&target.servers);
        for app in &apps {
            if !opts.release_dir.join(app).is_dir() {
                return Err(Error::MissingReleaseApp {
                    app: app.clone(),
                    release: opts.release_number,
                });
            }
        }

        o_step!("\n{}", "📦 Syncing deployment...".cyan());
        let bundle = tempfile::Builder::new()
            .prefix("appctl-deploy-")
            .tempdir_in(&self.bundle_root)?;
        let bundle_dir = bundle.path().join(&deployment);
        self.write_bundle(&bundle_dir, &deployment, &target, &control, &apps, opts)?;

        // 10. transfer, then the bundle goes no matter what
        let sources = [bundle_dir.display().to_string()];
        let transfer = sync_with_retry(
            self.ssh.as_ref(),
            &control_host,
            &sources,
            &format!("{}/", REMOTE_DEPLOYMENTS_DIR),
            opts.retry,
        )
        .await;
        let cleanup = bundle.close();
        transfer?;
        cleanup?;
        o_detail!("   {} Deployment {} uploaded", "✔".green(), deployment);

        // 11. dispatch, exactly once
        o_step!("\n{}", "📡 Control server deploying to others...".cyan());
        let args = [opts.email.clone(), deployment.clone()];
        let remote = self
            .ssh
            .run_script(&control_host, REMOTE_SCRIPTS_DIR, DEPLOY_SCRIPT, &args)
            .await?;
        print_remote_output(&remote);
        if !remote.success() {
            return Err(Error::RemoteScriptFailed {
                script: DEPLOY_SCRIPT.to_string(),
                host: control_host.address.clone(),
                exit_code: remote.exit_code,
            });
        }

        Ok(DeployReport {
            deployment,
            release: opts.release_number,
            control_server: control,
            keypair_generated,
            keys_installed,
            bootstrap,
            apps,
        })
    }

    /// Re-trust any server whose registry fingerprint moved since the last
    /// deploy of this target, then record the current one as the baseline.
    async fn check_drift(&self, target: &mut DeployTarget) -> Result<()> {
        for server in &mut target.servers {
            let id = server.definition.unique_id.clone();
            let baseline = self
                .project
                .load()?
                .last_fingerprint(&target.name, &id)
                .map(str::to_string);

            if let Some(previous) = baseline {
                if previous != server.definition.fingerprint {
                    o_warn!(
                        "   {} {} ({}) changed identity since the last deploy of {}, resetting it",
                        "⚠".yellow(),
                        server.key,
                        server.definition.describe(),
                        target.name
                    );
                    server.definition = self.trust.reset_server(&id).await?;
                }
            }

            let fingerprint = server.definition.fingerprint.clone();
            self.project
                .update(|state| state.set_last_fingerprint(&target.name, &id, &fingerprint))?;
            self.trust
                .sync_known_hosts(server.definition.preferred_host()?, &fingerprint)?;
        }
        Ok(())
    }

    fn select_control_server(&self, target: &DeployTarget, opts: &DeployOptions) -> Result<ServerDefinition> {
        let key = target
            .master_server
            .as_ref()
            .or(opts.default_master_server.as_ref());

        let Some(key) = key else {
            return target
                .servers
                .first()
                .map(|s| s.definition.clone())
                .ok_or_else(|| Error::Config(format!("Deploy target \"{}\" has no servers", target.name)));
        };

        let resolved = self.registry.resolve(key)?;
        if let Some(member) = target
            .servers
            .iter()
            .find(|s| s.definition.unique_id == resolved.unique_id)
        {
            return Ok(member.definition.clone());
        }
        // Outside the target: it still has to be trusted locally.
        self.trust
            .sync_known_hosts(resolved.preferred_host()?, &resolved.fingerprint)?;
        Ok(resolved)
    }

    /// Generate the keypair when either half is missing. A new key voids
    /// every earlier installation for the target.
    async fn ensure_control_keypair(&self, target: &str, key: &Path) -> Result<bool> {
        let public = public_key_path(key);
        if key.exists() && public.exists() {
            return Ok(false);
        }

        o_detail!("   Control key did not exist for {}, creating...", target);
        for half in [key, public.as_path()] {
            if half.exists() {
                fs::remove_file(half)?;
            }
        }
        self.ssh.generate_keypair(key).await?;
        self.project
            .update(|state| state.clear_key_copied_for_target(target))?;
        Ok(true)
    }

    /// Install the control public key on every server not yet flagged for
    /// this target, all at once. The first host verification failure ends
    /// the run; other failures are collected.
    async fn distribute_control_key(&self, target: &DeployTarget, public_key: &Path) -> Result<Vec<String>> {
        let state = self.project.load()?;
        let mut pending = Vec::new();
        for server in &target.servers {
            if !state.key_copied(&target.name, &server.definition.unique_id) {
                pending.push((server.definition.unique_id.clone(), remote_host(&server.definition)?));
            }
        }
        if pending.is_empty() {
            o_detail!("   {} Control key already on every server", "✔".green());
            return Ok(Vec::new());
        }

        let mut installs: FuturesUnordered<_> = pending
            .into_iter()
            .map(|(id, host)| {
                let ssh = self.ssh.clone();
                async move {
                    let result = ssh.install_key(&host, public_key).await;
                    (id, host, result)
                }
            })
            .collect();

        let mut installed = Vec::new();
        let mut failures = Vec::new();
        while let Some((id, host, result)) = installs.next().await {
            match result {
                Ok(()) => {
                    self.project
                        .update(|state| state.set_key_copied(&target.name, &id, true))?;
                    o_detail!("   {} Control key installed on {}", "✔".green(), host.address);
                    installed.push(host.address);
                }
                Err(e @ TransportError::HostVerification { .. }) => return Err(e.into()),
                Err(e) => {
                    o_warn!("   {} {}", "✗".red(), e);
                    failures.push(e);
                }
            }
        }

        match failures.len() {
            0 => Ok(installed),
            1 => Err(failures.remove(0).into()),
            _ => Err(Error::KeyDistribution(failures)),
        }
    }

    /// One-time control server setup, shared by every project using the server.
    async fn bootstrap(&self, control: &ServerDefinition, host: &RemoteHost, email: &str) -> Result<BootstrapStatus> {
        if self.host.load()?.control_server_initialised(&control.unique_id) {
            return Ok(BootstrapStatus::AlreadyDone);
        }

        o_detail!("   Initialising control server {}...", host.address);
        let args = [email.to_string()];
        let failure = match self.ssh.run_script(host, REMOTE_SCRIPTS_DIR, INIT_SCRIPT, &args).await {
            Ok(output) => {
                print_remote_output(&output);
                if output.success() {
                    self.host.update(|state| {
                        state
                            .control_server_init
                            .insert(control.unique_id.clone(), true);
                    })?;
                    return Ok(BootstrapStatus::Completed);
                }
                format!("{} exited with code {}", INIT_SCRIPT, output.exit_code)
            }
            Err(e @ TransportError::HostVerification { .. }) => return Err(e.into()),
            Err(e) => e.to_string(),
        };

        o_warn!("\n   {}", "⚠ Control server initialisation failed".yellow().bold());
        o_warn!("   {}", failure);
        o_warn!(
            "   {}",
            "Continuing with the deploy; it will be retried on the next run.".yellow()
        );
        Ok(BootstrapStatus::Failed(failure))
    }

    fn write_bundle(
        &self,
        dir: &Path,
        deployment: &str,
        target: &DeployTarget,
        control: &ServerDefinition,
        apps: &[String],
        opts: &DeployOptions,
    ) -> Result<()> {
        let apps_dir = dir.join(BUNDLE_APPS_DIR);
        fs::create_dir_all(&apps_dir)?;

        let servers = target
            .servers
            .iter()
            .map(|s| bundle_server(&s.definition, &s.apps))
            .collect::<Result<Vec<_>>>()?;
        let config = BundleConfig {
            project: &opts.project_name,
            target: &target.name,
            deployment,
            release: opts.release_number,
            email: &opts.email,
            letsencrypt: opts.letsencrypt.as_ref(),
            master_server: bundle_server(control, &[])?,
            servers,
        };
        fs::write(dir.join(BUNDLE_CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;

        let key = dir.join(BUNDLE_CONTROL_KEY);
        fs::copy(&opts.control_key, &key)?;
        fs::set_permissions(&key, fs::Permissions::from_mode(0o600))?;

        for app in apps {
            copy_dir(&opts.release_dir.join(app), &apps_dir.join(app), &[])?;
        }
        o_debug!("   Bundle written to {}", dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeploymentConfig, ServerRole};
    use crate::errors::REMOTE_EXIT_CERT_FAILED;
    use crate::registry::NewServer;
    use crate::store::MemoryStore;
    use crate::testing::{Call, MockSsh};
    use std::time::Duration;
    use tempfile::TempDir;

    const DEPLOYMENT: &str = "shop---production";

    struct Fixture {
        dir: TempDir,
        project: Arc<dyn Store<ProjectState>>,
        host: Arc<dyn Store<HostState>>,
        mock: Arc<MockSsh>,
        orchestrator: Orchestrator,
        config: ProjectConfig,
        opts: DeployOptions,
    }

    fn role(server: &str, apps: &[&str]) -> ServerRole {
        ServerRole {
            server: server.to_string(),
            apps: apps
                .iter()
                .map(|a| AppRole {
                    app: a.to_string(),
                    domain: None,
                    web_path: None,
                })
                .collect(),
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let project: Arc<dyn Store<ProjectState>> = Arc::new(MemoryStore::default());
        let host: Arc<dyn Store<HostState>> = Arc::new(MemoryStore::default());
        let mock = Arc::new(MockSsh::default());

        let registry = ServerRegistry::new(host.clone());
        for (ip, key) in [("10.0.0.1", "k1"), ("10.0.0.2", "k2"), ("10.0.0.3", "k3")] {
            registry
                .register(NewServer {
                    ipv4: Some(ip.into()),
                    fingerprint: key.into(),
                    ..Default::default()
                })
                .unwrap();
            mock.set_host_key(ip, key);
        }

        let release_dir = dir.path().join("releases").join("release-1");
        for app in ["site", "api", "unused"] {
            write(&release_dir.join(app).join("release").join("index.js"), app);
            write(&release_dir.join(app).join("appMeta.json"), "{}");
        }
        let scripts_dir = dir.path().join("remote-scripts");
        write(&scripts_dir.join(INIT_SCRIPT), "");
        write(&scripts_dir.join(DEPLOY_SCRIPT), "");
        fs::create_dir_all(dir.path().join("bundles")).unwrap();

        let mut config = ProjectConfig::default();
        config.deployments.insert(
            "production".into(),
            DeploymentConfig {
                master_server: None,
                servers: vec![role("10.0.0.1", &["site", "api"]), role("10.0.0.2", &["api"])],
            },
        );

        let opts = DeployOptions {
            project_name: "shop".into(),
            email: "ops@example.com".into(),
            release_number: 1,
            release_dir,
            control_key: dir.path().join("keys").join("production"),
            scripts_dir,
            default_master_server: None,
            letsencrypt: None,
            retry: RetryPolicy::Forever { delay: Duration::ZERO },
        };

        let orchestrator = Orchestrator::new(
            project.clone(),
            host.clone(),
            mock.clone(),
            KnownHosts::new(dir.path().join("known_hosts")),
        )
        .with_bundle_root(dir.path().join("bundles"));

        Fixture {
            dir,
            project,
            host,
            mock,
            orchestrator,
            config,
            opts,
        }
    }

    impl Fixture {
        async fn deploy(&self) -> Result<DeployReport> {
            self.orchestrator
                .deploy(&self.config, "production", &self.opts)
                .await
        }

        fn id_of(&self, key: &str) -> String {
            ServerRegistry::new(self.host.clone())
                .resolve(key)
                .unwrap()
                .unique_id
        }

        fn bundle_root_is_empty(&self) -> bool {
            fs::read_dir(self.dir.path().join("bundles"))
                .unwrap()
                .next()
                .is_none()
        }

        fn known_hosts(&self) -> KnownHosts {
            KnownHosts::new(self.dir.path().join("known_hosts"))
        }
    }

    #[tokio::test]
    async fn test_first_deploy_runs_full_protocol() {
        let f = fixture();
        let report = f.deploy().await.unwrap();

        assert_eq!(report.deployment, DEPLOYMENT);
        assert!(report.keypair_generated);
        assert_eq!(report.bootstrap, BootstrapStatus::Completed);
        assert_eq!(report.apps, vec!["site", "api"]);
        assert_eq!(report.control_server.ipv4.as_deref(), Some("10.0.0.1"));
        let mut installed = f.mock.installs();
        installed.sort();
        assert_eq!(installed, vec!["10.0.0.1", "10.0.0.2"]);

        assert_eq!(
            f.mock.syncs_to(REMOTE_SCRIPTS_DIR),
            vec![vec![DEPLOY_SCRIPT.to_string(), INIT_SCRIPT.to_string()]]
        );
        let bundles = f.mock.syncs_to("appctl-master-deployments/");
        assert_eq!(bundles.len(), 1);
        let files = &bundles[0];
        for expected in [
            "shop---production/appctl.json",
            "shop---production/control-key",
            "shop---production/apps/site/release/index.js",
            "shop---production/apps/api/appMeta.json",
        ] {
            assert!(files.contains(&expected.to_string()), "missing {}", expected);
        }
        assert!(!files.iter().any(|f| f.contains("unused")));

        assert_eq!(
            f.mock.scripts(),
            vec![
                (INIT_SCRIPT.to_string(), vec!["ops@example.com".to_string()]),
                (
                    DEPLOY_SCRIPT.to_string(),
                    vec!["ops@example.com".to_string(), DEPLOYMENT.to_string()]
                ),
            ]
        );

        let state = f.project.load().unwrap();
        for key in ["10.0.0.1", "10.0.0.2"] {
            let id = f.id_of(key);
            assert!(state.key_copied("production", &id));
            assert!(state.last_fingerprint("production", &id).is_some());
        }
        assert!(f
            .host
            .load()
            .unwrap()
            .control_server_initialised(&f.id_of("10.0.0.1")));
        assert_eq!(
            f.known_hosts().records_for("10.0.0.2").unwrap(),
            vec!["10.0.0.2 ssh-ed25519 k2"]
        );
        assert!(f.bundle_root_is_empty());
    }

    #[tokio::test]
    async fn test_second_deploy_skips_completed_steps() {
        let f = fixture();
        f.deploy().await.unwrap();
        f.mock.clear_calls();

        let report = f.deploy().await.unwrap();

        assert!(!report.keypair_generated);
        assert!(report.keys_installed.is_empty());
        assert_eq!(report.bootstrap, BootstrapStatus::AlreadyDone);
        let calls = f.mock.calls();
        assert!(!calls.iter().any(|c| matches!(c, Call::Keygen(_) | Call::Install(_) | Call::Scan(_))));
        assert_eq!(f.mock.syncs_to(REMOTE_SCRIPTS_DIR).len(), 1);
        assert_eq!(f.mock.syncs_to("appctl-master-deployments/").len(), 1);
        assert_eq!(f.mock.scripts().len(), 1);
        assert_eq!(f.mock.scripts()[0].0, DEPLOY_SCRIPT);
    }

    #[tokio::test]
    async fn test_fingerprint_drift_resets_server_and_recopies_key() {
        let f = fixture();
        f.deploy().await.unwrap();
        f.mock.clear_calls();

        // Server 2 was reprovisioned and its new key recorded in the registry.
        let id2 = f.id_of("10.0.0.2");
        ServerRegistry::new(f.host.clone())
            .set_fingerprint(&id2, "k2-new")
            .unwrap();
        f.mock.set_host_key("10.0.0.2", "k2-new");

        let report = f.deploy().await.unwrap();

        assert_eq!(report.keys_installed, vec!["10.0.0.2"]);
        assert_eq!(report.bootstrap, BootstrapStatus::AlreadyDone);
        assert!(f.mock.calls().contains(&Call::Scan("10.0.0.2".into())));
        assert_eq!(
            f.project.load().unwrap().last_fingerprint("production", &id2),
            Some("k2-new")
        );
        assert_eq!(
            f.known_hosts().records_for("10.0.0.2").unwrap(),
            vec!["10.0.0.2 ssh-ed25519 k2-new"]
        );
    }

    #[tokio::test]
    async fn test_host_verification_during_key_install_aborts() {
        let f = fixture();
        f.mock.fail_install(
            "10.0.0.2",
            TransportError::HostVerification {
                host: "10.0.0.2".into(),
            },
        );

        let err = f.deploy().await.unwrap_err();

        assert!(matches!(err, Error::HostVerification { ref host } if host == "10.0.0.2"));
        assert!(!f.mock.calls().iter().any(|c| matches!(c, Call::Sync { .. } | Call::Script { .. })));
        assert!(!f
            .project
            .load()
            .unwrap()
            .key_copied("production", &f.id_of("10.0.0.2")));
        assert!(f.bundle_root_is_empty());
    }

    #[tokio::test]
    async fn test_other_install_failures_are_collected() {
        let f = fixture();
        for host in ["10.0.0.1", "10.0.0.2"] {
            f.mock.fail_install(
                host,
                TransportError::Unreachable {
                    host: host.into(),
                    reason: "timeout".into(),
                },
            );
        }
        let err = f.deploy().await.unwrap_err();
        assert!(matches!(err, Error::KeyDistribution(ref failures) if failures.len() == 2));
    }

    #[tokio::test]
    async fn test_single_install_failure_keeps_other_servers_flagged() {
        let f = fixture();
        f.mock.fail_install(
            "10.0.0.2",
            TransportError::CommandFailed {
                host: "10.0.0.2".into(),
                command: "ssh-copy-id".into(),
                status: "exit status: 1".into(),
                output: "denied".into(),
            },
        );

        let err = f.deploy().await.unwrap_err();

        assert!(matches!(err, Error::Transport(TransportError::CommandFailed { .. })));
        let state = f.project.load().unwrap();
        assert!(state.key_copied("production", &f.id_of("10.0.0.1")));
        assert!(!state.key_copied("production", &f.id_of("10.0.0.2")));
    }

    #[tokio::test]
    async fn test_missing_release_app_stops_before_bundle() {
        let mut f = fixture();
        f.config
            .deployments
            .get_mut("production")
            .unwrap()
            .servers
            .push(role("10.0.0.3", &["ghost"]));

        let err = f.deploy().await.unwrap_err();

        assert!(matches!(err, Error::MissingReleaseApp { ref app, release: 1 } if app == "ghost"));
        assert!(f.mock.syncs_to("appctl-master-deployments/").is_empty());
        assert!(!f.mock.scripts().iter().any(|(s, _)| s == DEPLOY_SCRIPT));
        assert!(f.bundle_root_is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_best_effort() {
        let f = fixture();
        f.mock.set_script_exit(INIT_SCRIPT, 1);

        let report = f.deploy().await.unwrap();

        assert!(matches!(report.bootstrap, BootstrapStatus::Failed(_)));
        assert!(!f
            .host
            .load()
            .unwrap()
            .control_server_initialised(&f.id_of("10.0.0.1")));
        assert_eq!(f.mock.scripts().last().unwrap().0, DEPLOY_SCRIPT);
    }

    #[tokio::test]
    async fn test_dispatch_failure_surfaces_exit_code() {
        let f = fixture();
        f.mock.set_script_exit(DEPLOY_SCRIPT, REMOTE_EXIT_CERT_FAILED);

        let err = f.deploy().await.unwrap_err();

        match &err {
            Error::RemoteScriptFailed { exit_code, host, .. } => {
                assert_eq!(*exit_code, REMOTE_EXIT_CERT_FAILED);
                assert_eq!(host, "10.0.0.1");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.hint().unwrap().contains("certificate"));
        assert_eq!(
            f.mock.scripts().iter().filter(|(s, _)| s == DEPLOY_SCRIPT).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_control_server_selection() {
        // global default
        let mut f = fixture();
        f.opts.default_master_server = Some("10.0.0.2".into());
        assert_eq!(
            f.deploy().await.unwrap().control_server.ipv4.as_deref(),
            Some("10.0.0.2")
        );

        // per-deployment override wins, even outside the target
        f.config.deployments.get_mut("production").unwrap().master_server = Some("10.0.0.3".into());
        let report = f.deploy().await.unwrap();
        assert_eq!(report.control_server.ipv4.as_deref(), Some("10.0.0.3"));
        assert_eq!(
            f.known_hosts().records_for("10.0.0.3").unwrap(),
            vec!["10.0.0.3 ssh-ed25519 k3"]
        );
        assert!(matches!(
            f.mock.calls().last(),
            Some(Call::Script { host, .. }) if host == "10.0.0.3"
        ));
    }

    #[tokio::test]
    async fn test_deleted_keypair_is_regenerated_and_redistributed() {
        let f = fixture();
        f.deploy().await.unwrap();
        fs::remove_file(&f.opts.control_key).unwrap();
        f.mock.clear_calls();

        let report = f.deploy().await.unwrap();

        assert!(report.keypair_generated);
        let mut installed = report.keys_installed.clone();
        installed.sort();
        assert_eq!(installed, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_transfer_retries_then_succeeds() {
        let f = fixture();
        f.mock.fail_next_syncs(vec![TransportError::Unreachable {
            host: "10.0.0.1".into(),
            reason: "connection reset".into(),
        }]);

        f.deploy().await.unwrap();

        assert_eq!(f.mock.syncs_to(REMOTE_SCRIPTS_DIR).len(), 2);
    }

    #[tokio::test]
    async fn test_host_verification_during_transfer_is_not_retried() {
        let f = fixture();
        f.mock.fail_next_syncs(vec![TransportError::HostVerification {
            host: "10.0.0.1".into(),
        }]);

        let err = f.deploy().await.unwrap_err();

        assert!(matches!(err, Error::HostVerification { .. }));
        assert_eq!(f.mock.syncs_to(REMOTE_SCRIPTS_DIR).len(), 1);
        assert!(f.mock.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_undefined_target_fails_before_any_remote_call() {
        let f = fixture();
        let err = f
            .orchestrator
            .deploy(&f.config, "staging", &f.opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(f.mock.calls().is_empty());
    }

    #[test]
    fn test_bundle_config_document() {
        let f = fixture();
        let definition = ServerRegistry::new(f.host.clone()).resolve("10.0.0.1").unwrap();
        let apps = vec![AppRole {
            app: "site".into(),
            domain: Some("shop.example.com".into()),
            web_path: Some("/shop".into()),
        }];
        let json = serde_json::to_value(bundle_server(&definition, &apps).unwrap()).unwrap();

        assert_eq!(json["ip"], "10.0.0.1");
        assert_eq!(json["fingerprint"], "k1");
        assert_eq!(json["uniqueId"], definition.unique_id.as_str());
        assert_eq!(json["apps"][0]["webPath"], "/shop");
        assert!(json.get("ipv6").is_none());
    }

    #[test]
    fn test_referenced_apps_first_seen_order() {
        let servers: Vec<ResolvedServer> = [role("a", &["api", "site"]), role("b", &["worker", "api"])]
            .into_iter()
            .map(|r| ResolvedServer {
                key: r.server.clone(),
                definition: ServerDefinition {
                    unique_id: r.server.clone(),
                    ipv4: None,
                    ipv6: None,
                    hostname: None,
                    fingerprint: "k".into(),
                },
                apps: r.apps,
            })
            .collect();
        assert_eq!(referenced_apps(&servers), vec!["api", "site", "worker"]);
    }
}
