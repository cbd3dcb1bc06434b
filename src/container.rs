//! Containerized profile: bake the install into a Docker image and run it
//! behind a single mapped endpoint port.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use crate::config::ProvisionConfig;
use crate::error::{Cause, ContainerError};
use crate::runner::{CommandLine, CommandRunner};

const DOCKERFILE_TEMPLATE: &str = include_str!("../templates/docker/Dockerfile");
const WEB_LAYER_TEMPLATE: &str = include_str!("../templates/docker/endpoint-web.Dockerfile");
const SSH_LAYER_TEMPLATE: &str = include_str!("../templates/docker/endpoint-ssh.Dockerfile");

/// Where the effective config is placed inside the image.
pub const IMAGE_CONFIG_PATH: &str = "/etc/g4up/config.toml";
const ENDPOINT_LABEL: &str = "io.g4up.endpoint";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE_TIME: Duration = Duration::from_millis(300);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Remote-access service exposed by the image.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// noVNC in the browser
    #[default]
    Web,
    /// OpenSSH server
    Ssh,
}

impl Endpoint {
    pub fn container_port(self) -> u16 {
        match self {
            Endpoint::Web => 6080,
            Endpoint::Ssh => 22,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Web => "web",
            Endpoint::Ssh => "ssh",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "web" => Some(Endpoint::Web),
            "ssh" => Some(Endpoint::Ssh),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to produce the image's build context.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub tag: String,
    pub base_image: String,
    pub endpoint: Endpoint,
    pub authorized_keys: Option<PathBuf>,
    /// The g4up binary copied into the image.
    pub executable: PathBuf,
    /// Config installed at [`IMAGE_CONFIG_PATH`].
    pub config: ProvisionConfig,
    pub context_dir: PathBuf,
}

impl ImageSpec {
    /// An ssh image must carry `authorized_keys`; root has no password.
    pub fn from_config(
        config: &ProvisionConfig,
        executable: PathBuf,
        context_dir: PathBuf,
    ) -> Result<Self, ContainerError> {
        if config.container.endpoint == Endpoint::Ssh {
            match &config.container.authorized_keys {
                None => {
                    return Err(ContainerError::Settings(
                        "the ssh endpoint needs container.authorized_keys".to_string(),
                    ))
                }
                Some(keys) if !keys.is_file() => {
                    return Err(ContainerError::Settings(format!(
                        "authorized_keys {keys:?} is not a file"
                    )))
                }
                Some(_) => {}
            }
        }

        let mut embedded = config.clone();
        // The profile inside the image is root's, whatever the host uses.
        embedded.profile.path = None;

        Ok(Self {
            tag: config.image_tag(),
            base_image: config.container.base_image.clone(),
            endpoint: config.container.endpoint,
            authorized_keys: config.container.authorized_keys.clone(),
            executable,
            config: embedded,
            context_dir,
        })
    }

    pub fn render_dockerfile(&self) -> String {
        let port = self.endpoint.container_port().to_string();
        let layer = match self.endpoint {
            Endpoint::Web => WEB_LAYER_TEMPLATE.to_string(),
            Endpoint::Ssh => {
                let keys = if self.authorized_keys.is_some() {
                    "COPY authorized_keys /root/.ssh/authorized_keys\nRUN chmod 600 /root/.ssh/authorized_keys\n"
                } else {
                    ""
                };
                SSH_LAYER_TEMPLATE.replace("{AUTHORIZED_KEYS}\n", keys)
            }
        };
        let layer = layer.replace("{PORT}", &port);

        DOCKERFILE_TEMPLATE
            .replace("{BASE_IMAGE}", &self.base_image)
            .replace("{CONFIG_PATH}", IMAGE_CONFIG_PATH)
            .replace("{ENDPOINT_LAYER}", layer.trim_end())
            .replace("{VERSION}", &self.config.version)
            .replace("{ENDPOINT}", self.endpoint.as_str())
    }

    /// Populate `context_dir` with the Dockerfile, binary, config and keys.
    pub fn prepare_context(&self) -> Result<(), ContainerError> {
        let dir = &self.context_dir;
        let context = |path: &Path, source: io::Error| ContainerError::Context {
            path: path.to_path_buf(),
            source,
        };

        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|err| context(dir, err))?;
        }
        fs::create_dir_all(dir).map_err(|err| context(dir, err))?;

        let dockerfile = dir.join("Dockerfile");
        fs::write(&dockerfile, self.render_dockerfile()).map_err(|err| context(&dockerfile, err))?;

        let binary = dir.join("g4up");
        fs::copy(&self.executable, &binary).map_err(|err| context(&self.executable, err))?;
        set_executable(&binary).map_err(|err| context(&binary, err))?;

        let config_path = dir.join("config.toml");
        let rendered = toml::to_string_pretty(&self.config)
            .map_err(|err| context(&config_path, io::Error::new(io::ErrorKind::InvalidData, err)))?;
        fs::write(&config_path, rendered).map_err(|err| context(&config_path, err))?;

        if let (Endpoint::Ssh, Some(keys)) = (self.endpoint, &self.authorized_keys) {
            fs::copy(keys, dir.join("authorized_keys")).map_err(|err| context(keys, err))?;
        }

        tracing::debug!(context = %dir.display(), "build context ready");
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub tag: String,
    pub id: String,
    pub endpoint: Endpoint,
}

/// Host port published for the endpoint's fixed container port. Only the
/// loopback interface is bound; the web endpoint has no password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Ipv4Addr,
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    /// Map `host_port`, or the container port itself when unset.
    pub fn for_endpoint(endpoint: Endpoint, host_port: Option<u16>) -> Self {
        let container_port = endpoint.container_port();
        Self {
            host_ip: Ipv4Addr::LOCALHOST,
            host_port: host_port.unwrap_or(container_port),
            container_port,
        }
    }

    pub fn host_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host_ip, self.host_port))
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host_ip, self.host_port, self.container_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: Option<String>,
    pub endpoint: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    #[serde(default)]
    config: Option<InspectedConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// Drives the docker CLI for image build, container run and teardown.
pub struct ContainerProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    startup_timeout: Duration,
}

impl<'a> ContainerProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, startup_timeout: Duration) -> Self {
        Self {
            runner,
            startup_timeout,
        }
    }

    pub fn build(&self, spec: &ImageSpec) -> Result<ImageHandle, ContainerError> {
        spec.prepare_context()?;

        let command = CommandLine::new("docker")
            .args(["build", "--tag"])
            .arg(spec.tag.clone())
            .path_arg(&spec.context_dir);
        tracing::info!(tag = %spec.tag, endpoint = %spec.endpoint, "building image");
        self.runner
            .run(&command)
            .map_err(|failure| ContainerError::ImageBuild(failure.into()))?;

        self.image(&spec.tag)
    }

    /// Resolve an existing image by tag or id.
    pub fn image(&self, reference: &str) -> Result<ImageHandle, ContainerError> {
        let inspect_error = |cause: Cause| ContainerError::Inspect {
            target: reference.to_string(),
            cause,
        };

        let command = CommandLine::new("docker")
            .args(["image", "inspect"])
            .arg(reference);
        let output = self
            .runner
            .capture(&command)
            .map_err(|failure| inspect_error(failure.into()))?;

        let images: Vec<InspectedImage> = serde_json::from_str(&output)
            .map_err(|err| inspect_error(Cause::Message(format!("unexpected inspect output: {err}"))))?;
        let image = images
            .into_iter()
            .next()
            .ok_or_else(|| inspect_error(Cause::Message("no such image".to_string())))?;

        let label = image
            .config
            .and_then(|config| config.labels)
            .and_then(|labels| labels.get(ENDPOINT_LABEL).cloned());
        let endpoint = label
            .as_deref()
            .and_then(Endpoint::from_label)
            .ok_or_else(|| {
                inspect_error(Cause::Message(format!(
                    "image has no valid '{ENDPOINT_LABEL}' label; was it built by g4up?"
                )))
            })?;

        Ok(ImageHandle {
            tag: reference.to_string(),
            id: image.id,
            endpoint,
        })
    }

    pub fn run(
        &self,
        image: &ImageHandle,
        mapping: &PortMapping,
    ) -> Result<ContainerHandle, ContainerError> {
        self.run_named(image, mapping, None)
    }

    /// Start the container detached and wait for its endpoint to accept
    /// connections. A container whose endpoint never comes up is removed.
    pub fn run_named(
        &self,
        image: &ImageHandle,
        mapping: &PortMapping,
        name: Option<&str>,
    ) -> Result<ContainerHandle, ContainerError> {
        let mut command = CommandLine::new("docker")
            .args(["run", "-d", "--rm", "-p"])
            .arg(mapping.to_string());
        if let Some(name) = name {
            command = command.args(["--name", name]);
        }
        command = command.arg(image.tag.clone());

        let output = self
            .runner
            .capture(&command)
            .map_err(|failure| ContainerError::Run(failure.into()))?;
        let id = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| ContainerError::Run(Cause::Message("docker run printed no container id".to_string())))?;

        let addr = mapping.host_addr();
        tracing::info!(%id, %addr, timeout = ?self.startup_timeout, "waiting for endpoint");

        let reachable = wait_reachable(addr, self.startup_timeout)
            .map_err(|err| ContainerError::Run(err.into()))?;
        if !reachable {
            if let Err(err) = self.remove(&id) {
                tracing::warn!(error = %err, "failed to remove unreachable container");
            }
            return Err(ContainerError::EndpointTimeout {
                addr,
                timeout: self.startup_timeout,
            });
        }

        Ok(ContainerHandle {
            id,
            name: name.map(str::to_string),
            endpoint: addr,
        })
    }

    pub fn stop(&self, container: &ContainerHandle) -> Result<(), ContainerError> {
        self.remove(&container.id)
    }

    /// Force-remove a container by id or name, freeing its host port.
    pub fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let command = CommandLine::new("docker").args(["rm", "-f", id]);
        self.runner
            .capture(&command)
            .map(|_| ())
            .map_err(|failure| ContainerError::Stop {
                id: id.to_string(),
                cause: failure.into(),
            })
    }
}

/// Poll `addr` until it holds a connection open or `limit` elapses.
pub fn wait_reachable(addr: SocketAddr, limit: Duration) -> io::Result<bool> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(poll_endpoint(addr, limit)))
}

async fn poll_endpoint(addr: SocketAddr, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if accepts_session(addr).await {
            return true;
        }
        if Instant::now() + POLL_INTERVAL >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// A connection counts once it is not closed straight away. Docker's port
/// proxy accepts on the host side before the service inside is listening,
/// then drops the connection.
async fn accepts_session(addr: SocketAddr) -> bool {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        _ => return false,
    };

    let mut buf = [0u8; 1];
    match timeout(SETTLE_TIME, stream.peek(&mut buf)).await {
        Err(_) => true,
        Ok(Ok(read)) => read > 0,
        Ok(Err(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::scripted::ScriptedRunner;
    use std::net::TcpListener;
    use tempfile::TempDir;

    const INSPECT_OUTPUT: &str = r#"[
        {
            "Id": "sha256:4f1c0de",
            "RepoTags": ["g4up/geant4:11.2.1"],
            "Config": {
                "Labels": {
                    "io.g4up.endpoint": "ssh",
                    "io.g4up.version": "11.2.1"
                }
            }
        }
    ]"#;

    fn spec(temp: &TempDir, endpoint: Endpoint) -> ImageSpec {
        let mut config = ProvisionConfig::default();
        config.container.endpoint = endpoint;
        config.profile.path = Some(PathBuf::from("/home/dev/.bashrc"));
        if endpoint == Endpoint::Ssh {
            let keys = temp.path().join("id.pub");
            fs::write(&keys, "ssh-ed25519 AAAA test").unwrap();
            config.container.authorized_keys = Some(keys);
        }

        let executable = temp.path().join("g4up-bin");
        fs::write(&executable, "#!/bin/sh\n").unwrap();
        ImageSpec::from_config(&config, executable, temp.path().join("context")).unwrap()
    }

    fn image(endpoint: Endpoint) -> ImageHandle {
        ImageHandle {
            tag: "g4up/geant4:11.2.1".to_string(),
            id: "sha256:4f1c0de".to_string(),
            endpoint,
        }
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_web_dockerfile() {
        let temp = TempDir::new().unwrap();
        let dockerfile = spec(&temp, Endpoint::Web).render_dockerfile();

        assert!(dockerfile.starts_with("FROM ubuntu:22.04\n"));
        assert!(dockerfile.contains("RUN g4up --config /etc/g4up/config.toml install"));
        assert!(dockerfile.contains("novnc websockify x11vnc xvfb"));
        assert!(dockerfile.contains("EXPOSE 6080"));
        assert!(dockerfile.contains("io.g4up.endpoint=\"web\""));
        assert!(!dockerfile.contains('{'));
    }

    #[test]
    fn test_ssh_dockerfile_with_keys() {
        let temp = TempDir::new().unwrap();
        let rendered = spec(&temp, Endpoint::Ssh).render_dockerfile();
        assert!(rendered.contains("openssh-server"));
        assert!(rendered.contains("EXPOSE 22"));
        assert!(rendered.contains("COPY authorized_keys /root/.ssh/authorized_keys"));
        assert!(!rendered.contains("{AUTHORIZED_KEYS}"));
    }

    #[test]
    fn test_ssh_image_requires_authorized_keys() {
        let temp = TempDir::new().unwrap();
        let mut config = ProvisionConfig::default();
        config.container.endpoint = Endpoint::Ssh;
        let executable = temp.path().join("g4up-bin");
        let context_dir = temp.path().join("context");

        let err = ImageSpec::from_config(&config, executable.clone(), context_dir.clone())
            .unwrap_err();
        assert!(matches!(err, ContainerError::Settings(_)));
        assert!(err.to_string().contains("authorized_keys"));

        config.container.authorized_keys = Some(temp.path().join("missing.pub"));
        let err = ImageSpec::from_config(&config, executable, context_dir).unwrap_err();
        assert!(err.to_string().contains("is not a file"));
    }

    #[test]
    fn test_prepare_context_writes_everything() {
        let temp = TempDir::new().unwrap();
        let spec = spec(&temp, Endpoint::Ssh);

        fs::create_dir_all(spec.context_dir.join("stale")).unwrap();
        spec.prepare_context().unwrap();

        let dir = &spec.context_dir;
        assert!(dir.join("Dockerfile").is_file());
        assert!(dir.join("g4up").is_file());
        assert!(dir.join("authorized_keys").is_file());
        assert!(!dir.join("stale").exists());

        let embedded =
            ProvisionConfig::from_toml(&fs::read_to_string(dir.join("config.toml")).unwrap())
                .unwrap();
        assert_eq!(embedded.version, "11.2.1");
        assert_eq!(embedded.profile.path, None);
    }

    #[test]
    fn test_build_runs_docker_and_inspects() {
        let temp = TempDir::new().unwrap();
        let spec = spec(&temp, Endpoint::Ssh);
        let runner = ScriptedRunner::new().on("docker", Some("inspect"), |_| {
            Ok(INSPECT_OUTPUT.to_string())
        });

        let provisioner = ContainerProvisioner::new(&runner, Duration::from_secs(1));
        let handle = provisioner.build(&spec).unwrap();

        assert_eq!(handle.id, "sha256:4f1c0de");
        assert_eq!(handle.endpoint, Endpoint::Ssh);
        let calls = runner.calls();
        assert_eq!(calls[0].args[..3], ["build", "--tag", "g4up/geant4:11.2.1"]);
        assert_eq!(calls[1].to_string(), "docker image inspect g4up/geant4:11.2.1");
    }

    #[test]
    fn test_build_failure_is_image_build_error() {
        let temp = TempDir::new().unwrap();
        let spec = spec(&temp, Endpoint::Web);
        let runner = ScriptedRunner::new().fail("docker", Some("build"), 1);

        let err = ContainerProvisioner::new(&runner, Duration::from_secs(1))
            .build(&spec)
            .unwrap_err();
        assert!(matches!(err, ContainerError::ImageBuild(_)));
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_image_without_label_is_rejected() {
        let runner = ScriptedRunner::new().on("docker", Some("inspect"), |_| {
            Ok(r#"[{"Id": "sha256:abc", "Config": {"Labels": null}}]"#.to_string())
        });

        let err = ContainerProvisioner::new(&runner, Duration::from_secs(1))
            .image("ubuntu:22.04")
            .unwrap_err();
        assert!(matches!(err, ContainerError::Inspect { .. }));
    }

    #[test]
    fn test_run_probes_listening_endpoint_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = ScriptedRunner::new().on("docker", Some("run"), |_| Ok("c0ffee\n".to_string()));

        let provisioner = ContainerProvisioner::new(&runner, Duration::from_secs(5));
        let mapping = PortMapping::for_endpoint(Endpoint::Web, Some(port));
        let container = provisioner
            .run_named(&image(Endpoint::Web), &mapping, Some("g4up-test"))
            .unwrap();

        assert_eq!(container.id, "c0ffee");
        assert_eq!(container.endpoint.port(), port);
        let run = &runner.calls()[0];
        assert!(run.has_arg(&format!("127.0.0.1:{port}:6080")));
        assert!(run.has_arg("--rm"));
        assert!(run.has_arg("g4up-test"));

        provisioner.stop(&container).unwrap();
        assert_eq!(runner.calls()[1].to_string(), "docker rm -f c0ffee");
        drop(listener);
    }

    #[test]
    fn test_run_times_out_and_removes_container() {
        let port = closed_port();
        let runner = ScriptedRunner::new().on("docker", Some("run"), |_| Ok("deadbeef\n".to_string()));

        let provisioner = ContainerProvisioner::new(&runner, Duration::from_millis(600));
        let mapping = PortMapping::for_endpoint(Endpoint::Ssh, Some(port));
        let err = provisioner.run(&image(Endpoint::Ssh), &mapping).unwrap_err();

        assert!(matches!(err, ContainerError::EndpointTimeout { .. }));
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].to_string(), "docker rm -f deadbeef");
    }

    #[test]
    fn test_run_failure_does_not_probe() {
        let runner = ScriptedRunner::new().fail("docker", Some("run"), 125);
        let mapping = PortMapping::for_endpoint(Endpoint::Web, None);

        let err = ContainerProvisioner::new(&runner, Duration::from_secs(1))
            .run(&image(Endpoint::Web), &mapping)
            .unwrap_err();
        assert!(matches!(err, ContainerError::Run(_)));
        assert_eq!(err.exit_code(), Some(125));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_port_mapping_binds_loopback_only() {
        let mapping = PortMapping::for_endpoint(Endpoint::Ssh, None);
        assert_eq!(mapping.to_string(), "127.0.0.1:22:22");
        assert_eq!(
            PortMapping::for_endpoint(Endpoint::Web, Some(8080)).to_string(),
            "127.0.0.1:8080:6080"
        );
        assert_eq!(mapping.host_addr(), SocketAddr::from((Ipv4Addr::LOCALHOST, 22)));
    }
}
