//! Error types shared by the registry, trust, release and deploy layers.

use std::path::PathBuf;

use thiserror::Error;

use crate::ssh::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Remote exit codes reserved by the control-server scripts.
pub const REMOTE_EXIT_WEBPATH_CONFLICT: i32 = 1;
pub const REMOTE_EXIT_CERT_FAILED: i32 = 2;
pub const REMOTE_EXIT_HOST_COMMAND_FAILED: i32 = 3;
pub const REMOTE_EXIT_HOST_VERIFICATION_FAILED: i32 = 4;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{field} {value} is already used by server {existing}")]
    DuplicateIdentity {
        field: &'static str,
        value: String,
        existing: String,
    },

    #[error("App at {} detected as multiple types ({})", .dir.display(), .detectors.join(", "))]
    AmbiguousAppType { dir: PathBuf, detectors: Vec<&'static str> },

    #[error("Two apps with the same name detected ({0})")]
    DuplicateAppName(String),

    #[error("Server {0} not found in global server definitions")]
    ServerNotDefined(String),

    #[error("Could not get ed25519 fingerprint of {host}: {reason}")]
    FingerprintUnavailable { host: String, reason: String },

    #[error("Host key verification failed for {host}")]
    HostVerification { host: String },

    #[error("Remote script {script} on server {host} failed, exit code {exit_code}")]
    RemoteScriptFailed {
        script: String,
        host: String,
        exit_code: i32,
    },

    #[error("App {app} is not part of release {release}")]
    MissingReleaseApp { app: String, release: u64 },

    #[error("Build of {app} failed: {message}")]
    BuildFailed { app: String, message: String },

    #[error("{0}")]
    Transport(TransportError),

    #[error("Control key distribution failed on {} servers: {}", .0.len(), join_failures(.0))]
    KeyDistribution(Vec<TransportError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn join_failures(failures: &[TransportError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HostVerification { host } => Error::HostVerification { host },
            other => Error::Transport(other),
        }
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::Io(err.into())
    }
}

impl Error {
    /// What the operator should do about this error, if there is anything specific.
    pub fn hint(&self) -> Option<String> {
        match self {
            Error::Config(_)
            | Error::DuplicateIdentity { .. }
            | Error::AmbiguousAppType { .. }
            | Error::DuplicateAppName(_) => {
                Some("Something is wrong with your input or configuration (appctl.toml / app.json).".into())
            }
            Error::ServerNotDefined(_) => {
                Some("Add the server first with `appctl add-server`.".into())
            }
            Error::FingerprintUnavailable { .. } => Some(
                "The host must be reachable and present an ed25519 host key before it can be trusted.".into(),
            ),
            Error::HostVerification { host } => Some(format!(
                "The identity of {} changed. If you reinstalled or reprovisioned it, run `appctl reset {}`.",
                host, host
            )),
            Error::RemoteScriptFailed { exit_code, .. } => Some(format!(
                "Remote exit code {}: {}",
                exit_code,
                remote_exit_meaning(*exit_code)
            )),
            Error::MissingReleaseApp { .. } => {
                Some("Create a release first with `appctl release`.".into())
            }
            Error::KeyDistribution(failures) => {
                let hosts: Vec<&str> = failures.iter().map(TransportError::host).collect();
                Some(format!(
                    "Check that {} can be reached over SSH, then deploy again.",
                    hosts.join(", ")
                ))
            }
            _ => None,
        }
    }
}

/// Human readable meaning of a control-server script exit code.
pub fn remote_exit_meaning(code: i32) -> &'static str {
    match code {
        REMOTE_EXIT_WEBPATH_CONFLICT => "two apps on the same domain claim the same web path",
        REMOTE_EXIT_CERT_FAILED => "certificate issuance failed on the control server",
        REMOTE_EXIT_HOST_COMMAND_FAILED => "a command failed on one of the downstream servers",
        REMOTE_EXIT_HOST_VERIFICATION_FAILED => {
            "a downstream server's host key did not match; reset that server and deploy again"
        }
        _ => "the remote command failed",
    }
}
