use super::common::Context;
use anyhow::Result;
use colored::Colorize;

/// List registered servers by group
pub async fn handle_list() -> Result<()> {
    let ctx = Context::load()?;
    let groups = ctx.registry().groups()?;

    if groups.values().all(Vec::is_empty) {
        o_warn!("{}", "No servers registered.".yellow());
        o_detail!();
        o_detail!("Add one with: appctl add-server --ipv4 <address>");
        return Ok(());
    }

    let bootstrapped = ctx.host.load()?.control_server_init;

    o_step!("{}", "Servers:".bold());
    for (group, servers) in &groups {
        o_detail!();
        o_detail!("  {} {}", "▸".cyan(), group.bold());
        for server in servers {
            let control = if bootstrapped.get(&server.unique_id).copied().unwrap_or(false) {
                " [control]".green()
            } else {
                "".normal()
            };
            o_detail!("    {}{}", server.describe().cyan().bold(), control);
            o_detail!("      id: {}", server.unique_id.dimmed());
            if let (Some(_), Some(v4)) = (&server.ipv6, &server.ipv4) {
                o_detail!("      ipv4: {}", v4);
            }
            o_debug!("      key: {}", server.fingerprint.dimmed());
        }
    }
    Ok(())
}
