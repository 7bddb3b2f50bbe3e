use super::common::Context;
use anyhow::Result;
use colored::Colorize;

/// Re-trust a server whose host key legitimately changed (e.g. a rebuilt VM).
pub async fn handle_reset(server: String) -> Result<()> {
    let ctx = Context::load()?;
    let group = ctx.registry().group_of(&server)?;

    o_step!("{} {}...", "🔄 Resetting".cyan(), server.bold());
    let definition = ctx.trust().reset_server(&server).await?;

    o_result!(
        "{} {} ({}) will be re-initialised and get the control key again on the next deploy",
        "✅".green(),
        definition.describe().cyan().bold(),
        group
    );
    Ok(())
}
