use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

#[macro_use]
mod output;

mod commands;
mod config;
mod errors;
mod orchestrator;
mod prompt;
mod registry;
mod release;
mod scanner;
mod ssh;
mod store;
#[cfg(test)]
mod testing;
mod trust;
mod utils;

use commands::add_server::AddServerArgs;
use commands::set::SettingKey;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only show results and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the project, its apps, releases and deploy targets
    Info,

    /// Build every app and package them as the next release
    Release,

    /// Deploy a release to a target defined in appctl.toml
    Deploy {
        target: String,
        /// Release number (default: latest)
        #[arg(long)]
        release: Option<u64>,
    },

    /// Create a release and deploy it
    QuickRelease { target: String },

    /// Register a server after fetching its host key
    AddServer {
        #[arg(long)]
        ipv4: Option<String>,
        #[arg(long)]
        ipv6: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        /// Server group (default: "default")
        #[arg(long)]
        group: Option<String>,
    },

    /// List registered servers
    Servers,

    /// Print the ed25519 host key a machine presents
    GetFingerprint { host: String },

    /// Trust the current host key of a server and redo its setup on the next deploy
    Reset { server: String },

    /// Set a global default; omit the value to clear it
    Set {
        #[arg(value_enum)]
        key: SettingKey,
        value: Option<String>,
    },

    /// Write a first appctl.toml for this project
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    output::init(output::Verbosity::from_flags(cli.quiet, cli.verbose));

    let result = match cli.command {
        Commands::Info => commands::info::handle_info().await,
        Commands::Release => commands::release::handle_release().await,
        Commands::Deploy { target, release } => {
            commands::deploy::handle_deploy(target, release).await
        }
        Commands::QuickRelease { target } => {
            commands::deploy::handle_quick_release(target).await
        }
        Commands::AddServer {
            ipv4,
            ipv6,
            hostname,
            group,
        } => {
            commands::add_server::handle_add_server(AddServerArgs {
                ipv4,
                ipv6,
                hostname,
                group,
            })
            .await
        }
        Commands::Servers => commands::servers::handle_list().await,
        Commands::GetFingerprint { host } => {
            commands::fingerprint::handle_get_fingerprint(host).await
        }
        Commands::Reset { server } => commands::reset::handle_reset(server).await,
        Commands::Set { key, value } => commands::set::handle_set(key, value).await,
        Commands::Init => commands::init::handle_init().await,
    };

    if let Err(e) = result {
        o_error!("{}: {:#}", "Error".red().bold(), e);
        let hint = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<errors::Error>())
            .and_then(errors::Error::hint);
        if let Some(hint) = hint {
            o_error!("{} {}", "Hint:".yellow().bold(), hint);
        }
        std::process::exit(1);
    }

    Ok(())
}
