use crate::config::ProvisionConfig;
use crate::environment::EnvironmentRegistration;
use crate::provisioner::Provisioner;
use crate::runner::SystemRunner;
use crate::{steps, ui};
use anyhow::{Context, Result};
use std::path::Path;

pub fn execute(config_path: Option<&Path>, dry_run: bool, skip_deps: bool) -> Result<()> {
    let config = ProvisionConfig::load(config_path)?;

    if dry_run {
        return print_plan(&config, skip_deps);
    }

    ui::info(format!(
        "Installing Geant4 {} into {}",
        config.version,
        config.install_root.display()
    ));

    let runner = SystemRunner::new();
    let paths = Provisioner::new(&runner)
        .skip_dependencies(skip_deps)
        .run(&config)
        .context("Geant4 installation failed")?;

    ui::success(
        "Installed",
        format!("Geant4 {} at {}", config.version, paths.prefix.display()),
    );
    ui::info(format!(
        "Open a new shell or run `source {}` to use it",
        paths.profile.display()
    ));
    Ok(())
}

fn print_plan(config: &ProvisionConfig, skip_deps: bool) -> Result<()> {
    ui::info(format!(
        "Dry run: Geant4 {} into {} (nothing will be executed)",
        config.version,
        config.install_root.display()
    ));

    for step in steps::plan(config, skip_deps) {
        ui::status(step.stage.label(), step.description);
    }

    let layout = config.layout();
    let registration = EnvironmentRegistration::for_install(
        &layout.activation_script(),
        &layout.prefix,
        &layout.include_dir(),
        &layout.prefix.join("lib"),
    );
    let profile = config.profile_path()?;
    ui::status("Profile", format!("{} would contain:", profile.display()));
    print!("{}", registration.managed_block(config.profile.shell));
    Ok(())
}
