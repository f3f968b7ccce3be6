mod args;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, Commands};
use gpmd::gpmenv;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // The root override must land before any component resolves paths.
    if let Some(root) = &cli.root {
        std::env::set_var(gpmenv::ENV_ROOT_DIR, root);
    }

    match cli.command {
        Commands::Run => commands::cmd_run().await,
        Commands::Info => commands::cmd_info().await,
        Commands::List => commands::cmd_list().await,
        Commands::Get { name } => commands::cmd_get(&name).await,
        Commands::Start { name } => commands::cmd_start(&name).await,
        Commands::Stop { name } => commands::cmd_stop(&name).await,
        Commands::Restart { name } => commands::cmd_restart(&name).await,
        Commands::Delete { name } => commands::cmd_delete(&name).await,
        Commands::Install {
            name,
            bin,
            package,
            version,
        } => commands::cmd_install(&name, &bin, &package, &version).await,
        Commands::Upgrade {
            name,
            version,
            package,
        } => commands::cmd_upgrade(&name, &version, &package).await,
        Commands::Rollback { name, version } => commands::cmd_rollback(&name, &version).await,
        Commands::Versions { name } => commands::cmd_versions(&name).await,
        Commands::Forget { name, version } => commands::cmd_forget(&name, &version).await,
        Commands::Push { local, remote } => commands::cmd_push(&local, &remote).await,
        Commands::Logs {
            name,
            follow,
            lines,
        } => commands::cmd_logs(&name, lines, follow).await,
        Commands::Shutdown { force } => commands::cmd_shutdown(force).await,
    }
}
