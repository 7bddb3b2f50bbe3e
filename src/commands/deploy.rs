use super::common::Context;
use crate::config;
use crate::orchestrator::{BootstrapStatus, DeployOptions, DeployReport};
use crate::prompt;
use anyhow::{bail, Result};
use colored::Colorize;

pub async fn handle_deploy(target: String, release: Option<u64>) -> Result<()> {
    let ctx = Context::load()?;
    deploy(&ctx, &target, release).await
}

/// Build a release and deploy it straight away.
pub async fn handle_quick_release(target: String) -> Result<()> {
    let ctx = Context::load()?;
    // a typo in the target should not cost a full build
    config::validate_target(&ctx.config, &target, &ctx.registry())?;

    let release = super::release::create_release(&ctx)?;
    o_step!();
    deploy(&ctx, &target, Some(release.number)).await
}

async fn deploy(ctx: &Context, target: &str, release: Option<u64>) -> Result<()> {
    let project_name = ctx.settings.project_name()?;
    let email = ensure_email(ctx)?;
    let (release_number, release_dir) = ctx.release_builder()?.resolve(release)?;

    let opts = DeployOptions {
        project_name,
        email,
        release_number,
        release_dir,
        control_key: ctx.settings.control_key_path(target),
        scripts_dir: ctx.settings.scripts_dir.clone(),
        default_master_server: ctx.settings.master_server.clone(),
        letsencrypt: ctx.settings.letsencrypt.clone(),
        retry: ctx.settings.transfer_retry,
    };

    let report = ctx.orchestrator().deploy(&ctx.config, target, &opts).await?;
    print_summary(&report);
    Ok(())
}

/// Certificate notifications need an address. Asked once, then kept in the
/// global settings.
fn ensure_email(ctx: &Context) -> Result<String> {
    if let Some(email) = &ctx.settings.email {
        return Ok(email.clone());
    }
    let interactive = prompt::interactive();
    if !interactive {
        bail!("No email address configured. Set one with `appctl set email <address>`.");
    }

    let Some(email) = prompt::input_optional("Email address for certificate notices:", interactive)?
    else {
        bail!("An email address is required to deploy");
    };
    if !email.contains('@') {
        bail!("\"{}\" does not look like an email address", email);
    }
    ctx.host.update(|state| state.email = Some(email.clone()))?;
    o_detail!("   {} Saved {} as the default email", "✔".green(), email.cyan());
    Ok(email)
}

fn print_summary(report: &DeployReport) {
    if report.keypair_generated {
        o_detail!("   A new control keypair was generated for this target");
    }
    if !report.keys_installed.is_empty() {
        o_detail!(
            "   Control key installed on {}",
            report.keys_installed.join(", ").cyan()
        );
    }
    if let BootstrapStatus::Failed(reason) = &report.bootstrap {
        o_warn!(
            "\n{} The control server was not initialised: {}",
            "⚠".yellow(),
            reason
        );
        o_warn!("  The next deploy will try again.");
    }

    o_result!(
        "\n{} Release {} of {} deployed via {}",
        "✅".green(),
        report.release.to_string().green().bold(),
        report.deployment.cyan(),
        report.control_server.describe().cyan()
    );
    o_detail!("   Apps: {}", report.apps.join(", "));
}
