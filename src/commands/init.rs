use super::common::Context;
use crate::config::{AppRole, DeploymentConfig, ProjectConfig, ServerRole, PROJECT_CONFIG_FILE};
use crate::prompt;
use crate::registry::ServerDefinition;
use crate::release::APP_DESCRIPTOR;
use crate::utils::{name_from_dir, validate_name};
use anyhow::{bail, Context as _, Result};
use colored::Colorize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_TARGET: &str = "production";

/// Name under which a server is written into appctl.toml.
fn server_key(server: &ServerDefinition) -> String {
    match &server.hostname {
        Some(hostname) => hostname.clone(),
        None => server
            .preferred_host()
            .map(str::to_string)
            .unwrap_or_else(|_| server.unique_id.clone()),
    }
}

fn app_dirs(project_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(project_dir)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if entry.file_type()?.is_dir() && !hidden {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn choose_app_dir(project_dir: &Path, interactive: bool) -> Result<PathBuf> {
    let existing = app_dirs(project_dir)?;
    let mut options: Vec<String> = existing
        .iter()
        .map(|d| name_from_dir(d))
        .collect();
    options.push("a new directory".to_string());

    o_detail!("\n   Which directory holds the app?");
    let choice = prompt::select("Directory", &options, 0, interactive)?;
    if let Some(dir) = existing.get(choice) {
        return Ok(dir.clone());
    }
    if !interactive {
        bail!("No app directory found in {}", project_dir.display());
    }
    let name = prompt::input_with_default("New directory name", "web", interactive)?;
    let dir = project_dir.join(validate_name("app", &name)?);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn app_descriptor(interactive: bool) -> Result<Map<String, Value>> {
    let mut descriptor = Map::new();

    if !prompt::confirm_yes("Is it a web app served as static files?", interactive)? {
        let main = prompt::input_with_default("Entry point", "server.js", interactive)?;
        descriptor.insert("runtime".into(), Value::from("node"));
        descriptor.insert("main".into(), Value::from(main));
    }
    if prompt::confirm_no("Does it need a build step?", interactive)? {
        let cmd = prompt::input_with_default("Build command", "npm run build", interactive)?;
        let path = prompt::input_with_default("Build output directory", "build", interactive)?;
        descriptor.insert("buildCmd".into(), Value::from(cmd));
        descriptor.insert("buildPath".into(), Value::from(path));
    }
    Ok(descriptor)
}

fn initial_config(server: String, app: AppRole) -> ProjectConfig {
    let target = DeploymentConfig {
        master_server: None,
        servers: vec![ServerRole {
            server,
            apps: vec![app],
        }],
    };
    ProjectConfig {
        deployments: [(DEFAULT_TARGET.to_string(), target)].into_iter().collect(),
        ..Default::default()
    }
}

/// Write a first appctl.toml (one target, one server, one app) and the
/// app's descriptor.
pub async fn handle_init() -> Result<()> {
    let ctx = Context::load()?;
    let config_path = ctx.project_dir.join(PROJECT_CONFIG_FILE);
    if config_path.exists() {
        o_warn!(
            "{} {} already exists, edit it directly",
            "⚠".yellow(),
            PROJECT_CONFIG_FILE
        );
        return Ok(());
    }

    let servers: Vec<ServerDefinition> = ctx
        .registry()
        .groups()?
        .into_values()
        .flatten()
        .collect();
    if servers.is_empty() {
        bail!("No servers registered. Add one with `appctl add-server` first.");
    }

    let interactive = prompt::interactive();
    o_step!("{}", "📝 Setting up appctl for this project...".cyan());

    o_detail!("\n   Which server should the {} target use?", DEFAULT_TARGET);
    let labels: Vec<String> = servers.iter().map(ServerDefinition::describe).collect();
    let choice = prompt::select("Server", &labels, 0, interactive)?;
    let Some(server) = servers.get(choice) else {
        bail!("No server selected");
    };

    let app_dir = choose_app_dir(&ctx.project_dir, interactive)?;
    let app_name = validate_name("app", &name_from_dir(&app_dir))?;
    let descriptor = app_descriptor(interactive)?;

    let domain = prompt::input_optional("Domain name (leave empty for none):", interactive)?;
    let web_path = match &domain {
        Some(_) => Some(prompt::input_with_default("Path on that domain", "/", interactive)?),
        None => None,
    };

    let config = initial_config(
        server_key(server),
        AppRole {
            app: app_name.clone(),
            domain,
            web_path,
        },
    );
    fs::write(&config_path, toml::to_string_pretty(&config)?)
        .with_context(|| format!("Cannot write {}", config_path.display()))?;
    o_detail!("   {} Wrote {}", "✔".green(), PROJECT_CONFIG_FILE);

    let descriptor_path = app_dir.join(APP_DESCRIPTOR);
    if descriptor_path.exists() {
        o_detail!("   Keeping the existing {}", descriptor_path.display());
    } else {
        fs::write(&descriptor_path, serde_json::to_string_pretty(&descriptor)?)
            .with_context(|| format!("Cannot write {}", descriptor_path.display()))?;
        o_detail!("   {} Wrote {}", "✔".green(), descriptor_path.display());
    }

    o_result!(
        "\n{} {} is ready. Run {} then {}",
        "✅".green(),
        app_name.cyan().bold(),
        "appctl release".bold(),
        format!("appctl deploy {}", DEFAULT_TARGET).bold()
    );
    Ok(())
}
