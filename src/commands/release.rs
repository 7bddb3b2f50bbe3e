use super::common::Context;
use crate::release::Release;
use anyhow::{Context as _, Result};
use colored::Colorize;

pub async fn handle_release() -> Result<()> {
    let ctx = Context::load()?;
    let release = create_release(&ctx)?;
    o_result!(
        "\n{} Release {} ({} app{})",
        "✅".green(),
        release.number.to_string().green().bold(),
        release.apps.len(),
        if release.apps.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

pub fn create_release(ctx: &Context) -> Result<Release> {
    let name = ctx.settings.project_name()?;
    let builder = ctx.release_builder()?;
    builder
        .create()
        .with_context(|| format!("Release of {} failed", name))
}
