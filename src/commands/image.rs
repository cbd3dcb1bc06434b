use crate::cli::ImageAction;
use crate::config::ProvisionConfig;
use crate::container::{ContainerProvisioner, Endpoint, ImageSpec, PortMapping};
use crate::runner::SystemRunner;
use crate::ui;
use crate::util::xdg;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use std::time::Duration;

pub fn execute(config_path: Option<&Path>, action: ImageAction) -> Result<()> {
    let mut config = ProvisionConfig::load(config_path)?;
    let runner = SystemRunner::new();

    match action {
        ImageAction::Build { endpoint, tag } => {
            if let Some(endpoint) = endpoint {
                config.container.endpoint = endpoint;
            }
            if tag.is_some() {
                config.container.tag = tag;
            }

            let executable = env::current_exe().context("Failed to locate the g4up executable")?;
            let context_dir = xdg::cache_dir()?.join("image-context");
            let spec = ImageSpec::from_config(&config, executable, context_dir)?;

            ui::status(
                "Building",
                format!("{} ({} endpoint)", spec.tag, spec.endpoint),
            );
            let provisioner = ContainerProvisioner::new(&runner, startup_timeout(&config, None));
            let image = provisioner
                .build(&spec)
                .context("Image build failed")?;
            ui::success("Built", format!("{} {}", image.tag, short_id(&image.id)));
            Ok(())
        }

        ImageAction::Run {
            image,
            port,
            name,
            timeout,
        } => {
            let reference = image.unwrap_or_else(|| config.image_tag());
            let provisioner =
                ContainerProvisioner::new(&runner, startup_timeout(&config, timeout));

            let image = provisioner.image(&reference)?;
            let mapping = PortMapping::for_endpoint(image.endpoint, port);
            ui::status("Starting", format!("{} with -p {}", image.tag, mapping));

            let container = provisioner
                .run_named(&image, &mapping, name.as_deref())
                .context("Container did not start")?;

            ui::success(
                "Running",
                format!("container {} at {}", short_id(&container.id), container.endpoint),
            );
            match image.endpoint {
                Endpoint::Web => ui::info(format!(
                    "open http://{}/vnc.html in a browser",
                    container.endpoint
                )),
                Endpoint::Ssh => ui::info(format!(
                    "connect with `ssh -p {} root@{}`",
                    container.endpoint.port(),
                    container.endpoint.ip()
                )),
            }
            println!("{}", container.id);
            Ok(())
        }

        ImageAction::Stop { container } => {
            let provisioner = ContainerProvisioner::new(&runner, startup_timeout(&config, None));
            provisioner.remove(&container)?;
            ui::success("Stopped", &container);
            Ok(())
        }
    }
}

fn startup_timeout(config: &ProvisionConfig, override_secs: Option<u64>) -> Duration {
    Duration::from_secs(override_secs.unwrap_or(config.container.startup_timeout_secs))
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("sha256:0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("c0ffee"), "c0ffee");
    }

    #[test]
    fn test_startup_timeout_override() {
        let config = ProvisionConfig::default();
        assert_eq!(startup_timeout(&config, None), Duration::from_secs(60));
        assert_eq!(startup_timeout(&config, Some(5)), Duration::from_secs(5));
    }
}
