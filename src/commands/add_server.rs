use super::common::Context;
use crate::prompt;
use crate::registry::{NewServer, DEFAULT_GROUP};
use anyhow::{bail, Context as _, Result};
use colored::Colorize;
use std::net::{Ipv4Addr, Ipv6Addr};

pub struct AddServerArgs {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub hostname: Option<String>,
    pub group: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Register a server after fetching its host key.
pub async fn handle_add_server(args: AddServerArgs) -> Result<()> {
    let ctx = Context::load()?;

    // prompt only when nothing was given on the command line
    let interactive =
        prompt::interactive() && args.ipv4.is_none() && args.ipv6.is_none();
    let args = if interactive {
        o_step!("{}", "New server".bold());
        AddServerArgs {
            ipv4: prompt::input_optional("IPv4 address (leave empty for none):", true)?,
            ipv6: prompt::input_optional("IPv6 address (leave empty for none):", true)?,
            hostname: prompt::input_optional("Hostname (leave empty for none):", true)?,
            group: Some(prompt::input_with_default("Group", DEFAULT_GROUP, true)?),
        }
    } else {
        args
    };

    let ipv4 = non_empty(args.ipv4);
    let ipv6 = non_empty(args.ipv6);
    if let Some(v4) = &ipv4 {
        v4.parse::<Ipv4Addr>()
            .with_context(|| format!("Invalid IPv4 address: {}", v4))?;
    }
    if let Some(v6) = &ipv6 {
        v6.parse::<Ipv6Addr>()
            .with_context(|| format!("Invalid IPv6 address: {}", v6))?;
    }
    let Some(address) = ipv6.clone().or_else(|| ipv4.clone()) else {
        bail!("Either --ipv4 or --ipv6 is required");
    };

    o_step!("{}", "🔍 Fetching host key...".cyan());
    let trust = ctx.trust();
    let fingerprint = trust.fetch_fingerprint(&address).await?;

    let (group, server) = ctx.registry().register(NewServer {
        ipv4,
        ipv6,
        hostname: non_empty(args.hostname),
        group: non_empty(args.group),
        fingerprint,
    })?;
    trust.sync_known_hosts(&address, &server.fingerprint)?;
    o_debug!(
        "   Recorded in {}",
        trust.known_hosts().path().display()
    );

    o_result!(
        "{} Added {} to group {}",
        "✅".green(),
        server.describe().cyan().bold(),
        group.bold()
    );
    o_detail!("   id: {}", server.unique_id.dimmed());
    Ok(())
}
