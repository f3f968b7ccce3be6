use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gpmd")]
#[command(version)]
#[command(about = "Remotely-controlled process supervisor", long_about = None)]
pub(crate) struct Cli {
    /// Override the daemon root directory. Can also be set via GPMD_ROOT_DIR.
    #[arg(long, global = true)]
    pub root: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon in the foreground
    Run,

    /// Show daemon pid, version, platform and uptime
    Info,

    /// List managed services with live stats
    List,

    /// Show one service
    Get {
        /// Service name
        name: String,
    },

    /// Start a service
    Start { name: String },

    /// Stop a service
    Stop { name: String },

    /// Restart a service (stop, then start unconditionally)
    Restart { name: String },

    /// Delete a service (and its installed tree if gpmd installed it)
    Delete { name: String },

    /// Install a service from a tar.gz package
    Install {
        /// Service name
        name: String,
        /// Executable path inside the deployed version directory
        bin: String,
        /// Package to upload (tar.gz)
        package: String,
        /// Version string for this install
        #[arg(long, default_value = "v0.0.1")]
        version: String,
    },

    /// Upgrade a service to a new version from a tar.gz package
    Upgrade {
        name: String,
        version: String,
        package: String,
    },

    /// Roll back a service to a previously installed version
    Rollback { name: String, version: String },

    /// List a service's version history
    Versions { name: String },

    /// Prune a version's on-disk directory and history entry
    Forget { name: String, version: String },

    /// Push a local file to a path on the daemon host
    Push {
        /// Local file to upload
        local: String,
        /// Destination path on the host
        remote: String,
    },

    /// Stream a service's log
    Logs {
        name: String,

        /// Follow log output (stream continuously)
        #[arg(short = 'f', long)]
        follow: bool,

        /// Tail offset in bytes from the end (0 = from the beginning)
        #[arg(short = 'n', long, default_value = "0")]
        lines: u64,
    },

    /// Ask a running daemon to shut down
    Shutdown {
        /// Skip waiting for services to stop gracefully
        #[arg(long)]
        force: bool,
    },
}
