use crate::config::ProvisionConfig;
use crate::environment;
use crate::receipt::Receipt;
use crate::ui;
use anyhow::Result;
use std::path::Path;

pub fn execute(config_path: Option<&Path>) -> Result<()> {
    let config = ProvisionConfig::load(config_path)?;
    let layout = config.layout();

    let Some(receipt) = Receipt::load(&layout.receipt)? else {
        ui::info(format!(
            "No Geant4 install recorded under {}",
            layout.install_root.display()
        ));
        report_profile(&config.profile_path()?)?;
        return Ok(());
    };

    ui::status("Version", format!("Geant4 {}", receipt.toolkit.version));
    ui::status("Installed", &receipt.metadata.installed_at);
    if receipt.toolkit.prefix.is_dir() {
        ui::status("Prefix", receipt.toolkit.prefix.display());
    } else {
        ui::warn(format!(
            "prefix {} recorded but missing",
            receipt.toolkit.prefix.display()
        ));
    }
    ui::status("Libraries", receipt.toolkit.lib_dir.display());

    if receipt.toolkit.version != config.version {
        ui::warn(format!(
            "config asks for Geant4 {}; run `g4up install` to switch",
            config.version
        ));
    }

    ui::status("Shell", receipt.environment.shell.as_str());
    report_profile(&receipt.environment.profile)
}

fn report_profile(profile: &Path) -> Result<()> {
    if environment::is_registered(profile)? {
        ui::success("Profile", format!("{} has the Geant4 block", profile.display()));
    } else {
        ui::status("Profile", format!("{} is not set up", profile.display()));
    }
    Ok(())
}
