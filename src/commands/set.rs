use super::common::Context;
use crate::registry::ServerRegistry;
use crate::store::HostState;
use anyhow::{bail, Result};
use clap::ValueEnum;
use colored::Colorize;

/// Machine-wide defaults kept in the global state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SettingKey {
    Email,
    MasterServer,
    SshKey,
    ReleaseDir,
    ScriptsDir,
}

impl SettingKey {
    fn label(self) -> &'static str {
        match self {
            SettingKey::Email => "email",
            SettingKey::MasterServer => "master-server",
            SettingKey::SshKey => "ssh-key",
            SettingKey::ReleaseDir => "release-dir",
            SettingKey::ScriptsDir => "scripts-dir",
        }
    }

    fn slot(self, state: &mut HostState) -> &mut Option<String> {
        match self {
            SettingKey::Email => &mut state.email,
            SettingKey::MasterServer => &mut state.master_server,
            SettingKey::SshKey => &mut state.ssh_key,
            SettingKey::ReleaseDir => &mut state.release_dir,
            SettingKey::ScriptsDir => &mut state.scripts_dir,
        }
    }
}

fn check_value(key: SettingKey, value: &str, registry: &ServerRegistry) -> Result<()> {
    match key {
        SettingKey::Email if !value.contains('@') => {
            bail!("\"{}\" does not look like an email address", value)
        }
        SettingKey::MasterServer => {
            registry.resolve(value)?;
            Ok(())
        }
        _ if value.trim().is_empty() => bail!("{} cannot be empty", key.label()),
        _ => Ok(()),
    }
}

/// Set a global default, or clear it when no value is given.
pub async fn handle_set(key: SettingKey, value: Option<String>) -> Result<()> {
    let ctx = Context::load()?;
    apply(&ctx, key, value)
}

fn apply(ctx: &Context, key: SettingKey, value: Option<String>) -> Result<()> {
    if let Some(value) = &value {
        check_value(key, value, &ctx.registry())?;
    }
    let previous = ctx
        .host
        .update(|state| std::mem::replace(key.slot(state), value.clone()))?;

    match (&value, previous) {
        (Some(v), _) => {
            o_result!("{} {} = {}", "✅".green(), key.label().bold(), v.cyan());
        }
        (None, Some(_)) => {
            o_result!("{} {} cleared", "✅".green(), key.label().bold());
        }
        (None, None) => {
            o_warn!("{} {} was not set", "⚠".yellow(), key.label());
        }
    }
    Ok(())
}
