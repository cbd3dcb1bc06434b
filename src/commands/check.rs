use crate::config::{ProvisionConfig, SourceMethod};
use crate::{host, ui};
use anyhow::Result;
use std::path::Path;

pub fn execute(config_path: Option<&Path>) -> Result<()> {
    let config = ProvisionConfig::load(config_path)?;
    ui::success(
        "Config",
        format!(
            "Geant4 {} into {} ({} packages)",
            config.version,
            config.install_root.display(),
            config.packages.len()
        ),
    );

    let mut issues = 0usize;

    if !host::is_apt_based() {
        ui::warn("host is not Debian/Ubuntu; only `g4up image` is supported here");
        issues += 1;
    }

    for (tool, package) in host::missing_tools(host::REQUIRED_TOOLS) {
        ui::warn(format!("`{tool}` not found (installed by `g4up install` from {package})"));
        issues += 1;
    }

    if config.source.method == SourceMethod::Aria2c && !host::command_exists("aria2c") {
        ui::info("aria2c not found yet; it is installed with the dependencies");
    }

    if host::command_exists("docker") {
        ui::success("Docker", "available for `g4up image`");
    } else {
        ui::info("docker not found; `g4up image` is unavailable");
    }

    if !host::is_privileged() {
        ui::info(format!(
            "running as '{}'; `g4up install` must be run as root",
            host::current_user()
        ));
    }

    if issues == 0 {
        ui::success("Check", "host is ready");
    } else {
        ui::status("Check", format!("{issues} issue(s) found"));
    }
    Ok(())
}
