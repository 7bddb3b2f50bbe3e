// src/ssh.rs

use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use thiserror::Error;
use tokio::process::Command;

use crate::trust;
use crate::utils::shell_quote;

const REMOTE_USER: &str = "root";
const CONNECT_TIMEOUT_SECS: u32 = 10;
/// ssh reserves this exit status for its own (connection level) failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Failures reported by the SSH layer. Retry logic matches on these variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("host key verification failed for {host}")]
    HostVerification { host: String },

    #[error("{host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("{command} for {host} failed ({status}): {output}")]
    CommandFailed {
        host: String,
        command: String,
        status: String,
        output: String,
    },
}

impl TransportError {
    pub fn host(&self) -> &str {
        match self {
            TransportError::HostVerification { host }
            | TransportError::Unreachable { host, .. }
            | TransportError::CommandFailed { host, .. } => host,
        }
    }
}

/// `ssh-keygen` writes the public half next to the private key.
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

/// A server as seen by the SSH layer: where to connect and which key to expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub address: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything that leaves this machine goes through here.
#[async_trait]
pub trait Ssh: Send + Sync {
    /// Raw `ssh-keyscan` output for the host's ed25519 key.
    async fn scan_host_key(&self, host: &str) -> Result<String, TransportError>;

    /// Passphrase-less ed25519 keypair at `path` / `path.pub`.
    async fn generate_keypair(&self, path: &Path) -> Result<(), TransportError>;

    /// Append `public_key` to the remote user's authorized keys.
    async fn install_key(&self, host: &RemoteHost, public_key: &Path) -> Result<(), TransportError>;

    /// One transfer attempt. Extraneous files at `dest` are deleted.
    async fn sync(&self, host: &RemoteHost, sources: &[String], dest: &str) -> Result<(), TransportError>;

    /// Run a control-server script from `script_dir` with positional arguments.
    async fn run_script(
        &self,
        host: &RemoteHost,
        script_dir: &str,
        script: &str,
        args: &[String],
    ) -> Result<ScriptOutput, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Never,
    /// `attempts` includes the first try.
    Limited { attempts: u32, delay: Duration },
    Forever { delay: Duration },
}

impl RetryPolicy {
    /// Delay before the next attempt, or `None` to give up after `attempt` tries.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Never => None,
            RetryPolicy::Limited { attempts, delay } if attempt < attempts => Some(delay),
            RetryPolicy::Limited { .. } => None,
            RetryPolicy::Forever { delay } => Some(delay),
        }
    }
}

/// Transfer with retry. Host verification failures are returned at once.
pub async fn sync_with_retry(
    ssh: &dyn Ssh,
    host: &RemoteHost,
    sources: &[String],
    dest: &str,
    policy: RetryPolicy,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ssh.sync(host, sources, dest).await {
            Ok(()) => return Ok(()),
            Err(e @ TransportError::HostVerification { .. }) => return Err(e),
            Err(e) => match policy.delay_after(attempt) {
                Some(delay) => {
                    o_warn!(
                        "   {} {} (attempt {}), will retry...",
                        "⚠ Transfer failed:".yellow(),
                        e,
                        attempt
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

/// [`Ssh`] backed by the OpenSSH command line tools and rsync.
pub struct OpenSsh {
    identity: PathBuf,
    known_hosts: PathBuf,
}

impl OpenSsh {
    pub fn new(identity: PathBuf, known_hosts: PathBuf) -> Self {
        Self {
            identity,
            known_hosts,
        }
    }

    fn ssh_options(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
            "-o".into(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
            "-i".into(),
            self.identity.display().to_string(),
        ]
    }

    fn destination(host: &RemoteHost) -> String {
        format!("{}@{}", REMOTE_USER, host.address)
    }

    /// rsync splits `host:path` at the first colon, so IPv6 literals are bracketed.
    fn rsync_destination(host: &RemoteHost, dest: &str) -> String {
        if host.address.parse::<Ipv6Addr>().is_ok() {
            format!("{}@[{}]:{}", REMOTE_USER, host.address, dest)
        } else {
            format!("{}:{}", Self::destination(host), dest)
        }
    }

    fn remote_shell(&self) -> String {
        std::iter::once("ssh".to_string())
            .chain(self.ssh_options().iter().map(|o| shell_quote(o)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A connection-level failure is a host verification failure exactly when
    /// the host now presents a key other than the trusted one.
    async fn classify(&self, host: &RemoteHost, command: &str, output: &Output) -> TransportError {
        let detail = combined_output(output);
        match self.scan_host_key(&host.address).await {
            Ok(scan) => match trust::parse_keyscan(&scan) {
                Ok(presented) if presented != host.fingerprint => TransportError::HostVerification {
                    host: host.address.clone(),
                },
                _ => TransportError::CommandFailed {
                    host: host.address.clone(),
                    command: command.to_string(),
                    status: output.status.to_string(),
                    output: detail,
                },
            },
            Err(_) => TransportError::Unreachable {
                host: host.address.clone(),
                reason: detail,
            },
        }
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    text
}

fn spawn_failed(host: &str, command: &str, err: std::io::Error) -> TransportError {
    TransportError::CommandFailed {
        host: host.to_string(),
        command: command.to_string(),
        status: "not started".into(),
        output: format!("Failed to execute {} (is it installed?): {}", command, err),
    }
}

#[async_trait]
impl Ssh for OpenSsh {
    async fn scan_host_key(&self, host: &str) -> Result<String, TransportError> {
        o_debug!("   ssh-keyscan -t ed25519 {}", host);
        let output = Command::new("ssh-keyscan")
            .arg("-t")
            .arg("ed25519")
            .arg("-T")
            .arg(CONNECT_TIMEOUT_SECS.to_string())
            .arg(host)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_failed(host, "ssh-keyscan", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() || stdout.trim().is_empty() {
            return Err(TransportError::Unreachable {
                host: host.to_string(),
                reason: combined_output(&output),
            });
        }
        Ok(stdout)
    }

    async fn generate_keypair(&self, path: &Path) -> Result<(), TransportError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| spawn_failed("localhost", "ssh-keygen", e))?;
        }

        // -N "": no passphrase, the control server uses this key unattended
        let output = Command::new("ssh-keygen")
            .arg("-t")
            .arg("ed25519")
            .arg("-a")
            .arg("100")
            .arg("-N")
            .arg("")
            .arg("-C")
            .arg("appctl-control")
            .arg("-f")
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_failed("localhost", "ssh-keygen", e))?;

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                host: "localhost".into(),
                command: "ssh-keygen".into(),
                status: output.status.to_string(),
                output: combined_output(&output),
            });
        }
        Ok(())
    }

    async fn install_key(&self, host: &RemoteHost, public_key: &Path) -> Result<(), TransportError> {
        let mut cmd = Command::new("ssh-copy-id");
        cmd.arg("-i").arg(public_key);
        for opt in self.ssh_options().chunks(2) {
            // ssh-copy-id only forwards -o options
            if opt[0] == "-o" {
                cmd.arg("-o").arg(&opt[1]);
            }
        }
        cmd.arg("-o")
            .arg(format!("IdentityFile={}", self.identity.display()))
            .arg(Self::destination(host))
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| spawn_failed(&host.address, "ssh-copy-id", e))?;

        if output.status.success() {
            crate::output::print_lines(&String::from_utf8_lossy(&output.stdout), "   ");
            return Ok(());
        }
        Err(self.classify(host, "ssh-copy-id", &output).await)
    }

    async fn sync(&self, host: &RemoteHost, sources: &[String], dest: &str) -> Result<(), TransportError> {
        let remote_shell = self.remote_shell();
        let output = Command::new("rsync")
            .arg("-rzl")
            .arg("-e")
            .arg(&remote_shell)
            .arg("--delete")
            .arg("--timeout=10")
            .args(sources)
            .arg(Self::rsync_destination(host, dest))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_failed(&host.address, "rsync", e))?;

        if output.status.success() {
            return Ok(());
        }
        Err(self.classify(host, "rsync", &output).await)
    }

    async fn run_script(
        &self,
        host: &RemoteHost,
        script_dir: &str,
        script: &str,
        args: &[String],
    ) -> Result<ScriptOutput, TransportError> {
        let remote_cmd = script_command(script_dir, script, args);
        o_debug!("   {} $ {}", host.address, remote_cmd);

        let output = Command::new("ssh")
            .args(self.ssh_options())
            .arg(Self::destination(host))
            .arg(&remote_cmd)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_failed(&host.address, "ssh", e))?;

        let exit_code = output.status.code().unwrap_or(SSH_CONNECTION_FAILURE);
        if exit_code == SSH_CONNECTION_FAILURE {
            let failure = self.classify(host, "ssh", &output).await;
            return settle_exit_255(failure, &output);
        }
        Ok(script_output(exit_code, &output))
    }
}

fn script_command(script_dir: &str, script: &str, args: &[String]) -> String {
    let mut cmd = format!(
        "cd {} && python3 -B {}",
        shell_quote(script_dir),
        shell_quote(script)
    );
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&shell_quote(arg));
    }
    cmd
}

fn script_output(exit_code: i32, output: &Output) -> ScriptOutput {
    ScriptOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

/// ssh exits 255 both for its own failures and when the remote command does.
/// With the host reachable and presenting the trusted key, the 255 is handed
/// back as the script's exit code; its stderr then carries any ssh message.
fn settle_exit_255(failure: TransportError, output: &Output) -> Result<ScriptOutput, TransportError> {
    match failure {
        TransportError::CommandFailed { .. } => Ok(script_output(SSH_CONNECTION_FAILURE, output)),
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, MockSsh};

    fn host() -> RemoteHost {
        RemoteHost {
            address: "10.0.0.1".into(),
            fingerprint: "key1".into(),
        }
    }

    fn exited(code: i32, stderr: &str) -> Output {
        use std::os::unix::process::ExitStatusExt;
        Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_rsync_destination_brackets_ipv6() {
        let v6 = RemoteHost {
            address: "2001:db8::1".into(),
            fingerprint: "k".into(),
        };
        assert_eq!(
            OpenSsh::rsync_destination(&v6, "appctl-master-scripts"),
            "root@[2001:db8::1]:appctl-master-scripts"
        );
        assert_eq!(
            OpenSsh::rsync_destination(&host(), "appctl-master-deployments/"),
            "root@10.0.0.1:appctl-master-deployments/"
        );
        // ssh itself takes the bare address
        assert_eq!(OpenSsh::destination(&v6), "root@2001:db8::1");
    }

    #[test]
    fn test_ssh_options_pin_trust_file_and_identity() {
        let ssh = OpenSsh::new(
            PathBuf::from("/home/ops/.ssh/id ed25519"),
            PathBuf::from("/home/ops/.ssh/known_hosts"),
        );
        let opts = ssh.ssh_options();
        assert!(opts.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"UserKnownHostsFile=/home/ops/.ssh/known_hosts".to_string()));
        assert_eq!(opts[opts.len() - 2..], ["-i", "/home/ops/.ssh/id ed25519"]);
        assert!(ssh.remote_shell().ends_with("-i '/home/ops/.ssh/id ed25519'"));
    }

    #[test]
    fn test_script_command_quotes_arguments() {
        let cmd = script_command(
            "appctl-master-scripts",
            "control_deploy.py",
            &["ops@example.com".into(), "it's".into()],
        );
        assert_eq!(
            cmd,
            r"cd appctl-master-scripts && python3 -B control_deploy.py ops@example.com 'it'\''s'"
        );
    }

    #[test]
    fn test_exit_255_from_trusted_host_is_the_scripts_own() {
        let output = exited(255, "script blew up");
        let failure = TransportError::CommandFailed {
            host: "10.0.0.1".into(),
            command: "ssh".into(),
            status: "exit status: 255".into(),
            output: "script blew up".into(),
        };
        let settled = settle_exit_255(failure, &output).unwrap();
        assert_eq!(settled.exit_code, 255);
        assert_eq!(settled.stderr, "script blew up");

        let changed = TransportError::HostVerification {
            host: "10.0.0.1".into(),
        };
        assert_eq!(settle_exit_255(changed.clone(), &output), Err(changed));

        let down = TransportError::Unreachable {
            host: "10.0.0.1".into(),
            reason: "timeout".into(),
        };
        assert!(matches!(
            settle_exit_255(down, &output),
            Err(TransportError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_retry_policy_delays() {
        let d = Duration::from_millis(5);
        assert_eq!(RetryPolicy::Never.delay_after(1), None);
        let limited = RetryPolicy::Limited { attempts: 3, delay: d };
        assert_eq!(limited.delay_after(1), Some(d));
        assert_eq!(limited.delay_after(2), Some(d));
        assert_eq!(limited.delay_after(3), None);
        assert_eq!(RetryPolicy::Forever { delay: d }.delay_after(1000), Some(d));
    }

    #[tokio::test]
    async fn test_sync_retries_transient_failures() {
        let mock = MockSsh::default();
        mock.fail_next_syncs(vec![
            TransportError::Unreachable {
                host: "10.0.0.1".into(),
                reason: "connection reset".into(),
            },
            TransportError::Unreachable {
                host: "10.0.0.1".into(),
                reason: "timeout".into(),
            },
        ]);

        let policy = RetryPolicy::Forever { delay: Duration::ZERO };
        sync_with_retry(&mock, &host(), &["a/".into()], "dest", policy)
            .await
            .unwrap();

        let syncs = mock.calls().into_iter().filter(|c| matches!(c, Call::Sync { .. })).count();
        assert_eq!(syncs, 3);
    }

    #[tokio::test]
    async fn test_sync_gives_up_under_limited_policy() {
        let mock = MockSsh::default();
        mock.fail_next_syncs(vec![
            TransportError::Unreachable {
                host: "10.0.0.1".into(),
                reason: "down".into(),
            };
            5
        ]);
        let policy = RetryPolicy::Limited { attempts: 2, delay: Duration::ZERO };
        let err = sync_with_retry(&mock, &host(), &["a/".into()], "dest", policy)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_never_retries_host_verification() {
        let mock = MockSsh::default();
        mock.fail_next_syncs(vec![TransportError::HostVerification {
            host: "10.0.0.1".into(),
        }]);

        let policy = RetryPolicy::Forever { delay: Duration::ZERO };
        let err = sync_with_retry(&mock, &host(), &["a/".into()], "dest", policy)
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::HostVerification { .. }));
        assert_eq!(mock.calls().len(), 1);
    }
}
