use crate::config::ProvisionConfig;
use crate::environment::{EnvironmentRegistration, Shell};
use crate::provisioner::find_lib_dir;
use anyhow::Result;
use std::path::Path;

pub fn execute(config_path: Option<&Path>, shell: Option<Shell>) -> Result<()> {
    let config = ProvisionConfig::load(config_path)?;
    let shell = shell.unwrap_or(config.profile.shell);

    let layout = config.layout();
    let lib_dir = find_lib_dir(&layout.prefix).unwrap_or_else(|| layout.prefix.join("lib"));
    let registration = EnvironmentRegistration::for_install(
        &layout.activation_script(),
        &layout.prefix,
        &layout.include_dir(),
        &lib_dir,
    );

    println!("{}", registration.format_for_shell(shell));
    Ok(())
}
