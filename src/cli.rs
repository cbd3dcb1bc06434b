use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::container::Endpoint;
use crate::environment::Shell;

/// Geant4 provisioner - build and install the Geant4 toolkit
///
/// g4up installs Geant4 from source on Debian/Ubuntu hosts (system packages,
/// download, cmake, make, shell environment) or bakes the same install into
/// a Docker image reachable through a browser (noVNC) or SSH endpoint.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/g4up/config.toml)
    #[arg(short, long, global = true, env = "G4UP_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install Geant4 on this host (requires root)
    Install {
        /// Print the planned steps without running anything
        #[arg(long)]
        dry_run: bool,

        /// Do not install system packages
        #[arg(long)]
        skip_deps: bool,
    },

    /// Print the Geant4 environment directives for a shell
    Env {
        /// Shell type (defaults to the configured shell)
        #[arg(short, long, value_enum, value_name = "SHELL")]
        shell: Option<Shell>,
    },

    /// Show the recorded install and environment registration
    Status,

    /// Validate the config and look for required host tools
    Check,

    /// Inspect or create the config file
    #[command(subcommand)]
    Config(ConfigAction),

    /// Build and run the containerized install
    #[command(subcommand)]
    Image(ImageAction),
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageAction {
    /// Build the Geant4 image
    Build {
        /// Remote access endpoint baked into the image
        #[arg(short, long, value_enum)]
        endpoint: Option<Endpoint>,

        /// Image tag (defaults to g4up/geant4:<version>)
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Start a container and wait for its endpoint
    Run {
        /// Image tag or id (defaults to the configured tag)
        #[arg(value_name = "IMAGE")]
        image: Option<String>,

        /// Host port (defaults to the endpoint's container port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Container name
        #[arg(short, long)]
        name: Option<String>,

        /// Seconds to wait for the endpoint
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Stop and remove a container
    Stop {
        /// Container id or name
        #[arg(value_name = "CONTAINER")]
        container: String,
    },
}
