use crate::cli::ConfigAction;
use crate::config::ProvisionConfig;
use crate::ui;
use crate::util::xdg;
use anyhow::{bail, Result};
use std::path::Path;

pub fn execute(config_path: Option<&Path>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = ProvisionConfig::load(config_path)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path.to_path_buf(),
                None => xdg::config_file()?,
            };
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }

            ProvisionConfig::default().save(&path)?;
            ui::success("Created", path.display());
            Ok(())
        }
    }
}
