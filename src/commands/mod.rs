use crate::cli::{Cli, Commands};
use crate::error::{ContainerError, ProvisionError};
use anyhow::Result;

mod check;
mod config_cmd;
mod env;
mod image;
mod install;
mod status;

pub fn execute(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Install { dry_run, skip_deps } => {
            install::execute(config_path, dry_run, skip_deps)
        }

        Commands::Env { shell } => env::execute(config_path, shell),

        Commands::Status => status::execute(config_path),

        Commands::Check => check::execute(config_path),

        Commands::Config(action) => config_cmd::execute(config_path, action),

        Commands::Image(action) => image::execute(config_path, action),
    }
}

/// Process exit status for a failed command: the status of the external
/// tool that failed when there is one, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let tool_status = err.chain().find_map(|cause| {
        if let Some(err) = cause.downcast_ref::<ProvisionError>() {
            err.exit_code()
        } else if let Some(err) = cause.downcast_ref::<ContainerError>() {
            err.exit_code()
        } else {
            None
        }
    });

    match tool_status {
        Some(code) if (1..=255).contains(&code) => code as u8,
        _ => 1,
    }
}
