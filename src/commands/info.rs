use super::common::Context;
use crate::config::PROJECT_CONFIG_FILE;
use anyhow::Result;
use colored::Colorize;

/// Show what appctl sees in the current project.
pub async fn handle_info() -> Result<()> {
    let ctx = Context::load()?;
    let name = ctx.settings.project_name()?;
    let builder = ctx.release_builder()?;

    o_step!("{} {}", "Project:".bold(), name.cyan().bold());
    o_detail!("   Directory: {}", ctx.project_dir.display());
    o_detail!("   Releases:  {}", builder.releases().display());
    o_debug!("   Scripts:   {}", ctx.settings.scripts_dir.display());
    o_debug!("   SSH key:   {}", ctx.settings.ssh_key.display());

    o_step!("\n{}", "Apps:".bold());
    let apps = builder.detect_apps()?;
    if apps.is_empty() {
        o_detail!("   {}", "none found".dimmed());
    }
    for app in &apps {
        o_detail!(
            "   {} ({}) {}",
            app.name.green(),
            app.kind(),
            app.dir.display().to_string().dimmed()
        );
    }

    o_step!("\n{}", "Releases:".bold());
    match builder.latest()? {
        0 => {
            o_detail!("   {}", "none yet".dimmed());
        }
        n => {
            o_detail!("   latest: {}", n.to_string().green());
        }
    }

    o_step!("\n{}", "Targets:".bold());
    if ctx.config.deployments.is_empty() {
        o_detail!("   {} (define them in {})", "none".dimmed(), PROJECT_CONFIG_FILE);
    }
    for (name, target) in &ctx.config.deployments {
        let servers: Vec<&str> = target.servers.iter().map(|s| s.server.as_str()).collect();
        o_detail!("   {} → {}", name.cyan(), servers.join(", "));
    }
    Ok(())
}
