use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::container::Endpoint;
use crate::environment::Shell;
use crate::error::ProvisionError;
use crate::host;
use crate::util::xdg;

const DEFAULT_VERSION: &str = "11.2.1";
const DEFAULT_INSTALL_ROOT: &str = "/opt/geant4";
const DEFAULT_GIT_URL: &str = "https://github.com/Geant4/geant4.git";
const DEFAULT_BASE_IMAGE: &str = "ubuntu:22.04";
const DEFAULT_CONNECTIONS: u32 = 8;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;

/// Build and runtime packages installed before the toolkit is built.
const DEFAULT_PACKAGES: &[&str] = &[
    "build-essential",
    "cmake",
    "git",
    "curl",
    "wget",
    "aria2",
    "gdb",
    "qtbase5-dev",
    "libxerces-c-dev",
    "libexpat1-dev",
    "libgl1-mesa-dev",
    "libglu1-mesa-dev",
    "libxmu-dev",
    "libmotif-dev",
];

const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar"];

/// Everything the provisioner needs to know, fixed for the whole run.
///
/// Loaded once from `config.toml` (or compiled-in defaults), normalized and
/// validated, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
    /// Parallel build jobs; unset or 0 uses every detected core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub build: BuildOptions,
    #[serde(default)]
    pub source: SourceOptions,
    #[serde(default)]
    pub profile: ProfileOptions,
    #[serde(default)]
    pub cleanup: CleanupOptions,
    #[serde(default)]
    pub container: ContainerOptions,
}

/// Optional Geant4 subsystems passed to cmake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildOptions {
    #[serde(default = "enabled")]
    pub install_data: bool,
    #[serde(default = "enabled")]
    pub use_qt: bool,
    #[serde(default = "enabled")]
    pub use_opengl_x11: bool,
    /// Additional `-DKEY=VALUE` cache entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            install_data: true,
            use_qt: true,
            use_opengl_x11: true,
            extra: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    /// cmake cache definitions for the optional subsystems, in a stable order.
    pub fn cmake_definitions(&self) -> Vec<String> {
        let mut definitions = vec![
            format!("-DGEANT4_INSTALL_DATA={}", on_off(self.install_data)),
            format!("-DGEANT4_USE_QT={}", on_off(self.use_qt)),
            format!("-DGEANT4_USE_OPENGL_X11={}", on_off(self.use_opengl_x11)),
        ];
        definitions.extend(
            self.extra
                .iter()
                .map(|(key, value)| format!("-D{key}={value}")),
        );
        definitions
    }
}

/// How the source tree is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMethod {
    /// Parallel download with aria2c.
    #[default]
    Aria2c,
    /// Built-in HTTP client.
    Http,
    /// Clone the release tag from git.
    Git,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceOptions {
    #[serde(default)]
    pub method: SourceMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_git_url")]
    pub git_url: String,
    #[serde(default = "default_connections")]
    pub connections: u32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            method: SourceMethod::default(),
            url: None,
            git_url: default_git_url(),
            connections: DEFAULT_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileOptions {
    #[serde(default)]
    pub shell: Shell,
    /// Shell startup file; derived from `$HOME` and `shell` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupOptions {
    #[serde(default)]
    pub keep_archive: bool,
    #[serde(default)]
    pub keep_build_dir: bool,
    #[serde(default)]
    pub keep_source_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerOptions {
    #[serde(default = "default_base_image")]
    pub base_image: String,
    /// Image tag; `g4up/geant4:<version>` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Public keys installed for root when the endpoint is ssh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_keys: Option<PathBuf>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            tag: None,
            endpoint: Endpoint::default(),
            authorized_keys: None,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            install_root: default_install_root(),
            packages: default_packages(),
            jobs: None,
            build: BuildOptions::default(),
            source: SourceOptions::default(),
            profile: ProfileOptions::default(),
            cleanup: CleanupOptions::default(),
            container: ContainerOptions::default(),
        }
    }
}

/// Paths derived from the install root and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub install_root: PathBuf,
    pub archive: PathBuf,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub prefix: PathBuf,
    pub receipt: PathBuf,
}

impl Layout {
    /// `geant4.sh`, generated by the toolkit's install step.
    pub fn activation_script(&self) -> PathBuf {
        self.prefix.join("bin").join("geant4.sh")
    }

    pub fn include_dir(&self) -> PathBuf {
        self.prefix.join("include").join("Geant4")
    }

    /// Scratch directory archives are unpacked into before promotion.
    pub fn extract_dir(&self) -> PathBuf {
        self.install_root.join(".g4up-extract")
    }
}

impl ProvisionConfig {
    /// Load the config from `explicit`, or from the default location if a
    /// file exists there, or fall back to the compiled-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Some(xdg::config_file()?).filter(|path| path.exists()),
        };

        let config = match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                Self::from_toml(&contents)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?
            }
            None => {
                tracing::debug!("no config file found, using defaults");
                Self::default()
            }
        };

        Ok(config.normalize()?)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize g4up config")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file {:?}", path))?;
        Ok(())
    }

    /// Expand `~` and `$VAR` in paths, then validate.
    pub fn normalize(mut self) -> Result<Self, ProvisionError> {
        self.install_root = expand_path(&self.install_root)?;
        if let Some(path) = self.profile.path.take() {
            self.profile.path = Some(expand_path(&path)?);
        }
        if let Some(path) = self.container.authorized_keys.take() {
            self.container.authorized_keys = Some(expand_path(&path)?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        let invalid = |msg: String| Err(ProvisionError::InvalidConfig(msg));

        let version = Regex::new(r"^\d+\.\d+(\.\d+)?$").expect("static regex");
        if !version.is_match(&self.version) {
            return invalid(format!(
                "version '{}' must look like MAJOR.MINOR[.PATCH]",
                self.version
            ));
        }

        if !self.install_root.is_absolute() {
            return invalid(format!(
                "install_root {:?} must be an absolute path",
                self.install_root
            ));
        }

        let profile_paths = [
            ("install_root", Some(&self.install_root)),
            ("profile.path", self.profile.path.as_ref()),
        ];
        for (field, path) in profile_paths {
            let Some(path) = path else { continue };
            if let Some(bad) = unquotable_char(path) {
                return invalid(format!(
                    "{field} {path:?} contains {bad:?}, which cannot appear in a shell profile"
                ));
            }
        }

        if self.packages.is_empty() {
            return invalid("packages must list at least one package".to_string());
        }
        let package = Regex::new(r"^[a-z0-9][a-z0-9+.\-]+(=[A-Za-z0-9.+~:\-]+)?$")
            .expect("static regex");
        if let Some(bad) = self.packages.iter().find(|name| !package.is_match(name)) {
            return invalid(format!("'{bad}' is not a valid package name"));
        }

        let cache_key = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex");
        if let Some(bad) = self.build.extra.keys().find(|key| !cache_key.is_match(key)) {
            return invalid(format!("build.extra key '{bad}' is not a valid cmake variable"));
        }

        if let Some(raw) = &self.source.url {
            let parsed = Url::parse(raw)
                .map_err(|err| ProvisionError::InvalidConfig(format!("source.url '{raw}': {err}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return invalid(format!("source.url '{raw}' must use http or https"));
            }
        }

        if self.source.method == SourceMethod::Git && self.source.git_url.trim().is_empty() {
            return invalid("source.git_url must not be empty".to_string());
        }

        if self.source.connections == 0 || self.source.connections > 16 {
            return invalid("source.connections must be between 1 and 16".to_string());
        }

        if self.container.startup_timeout_secs == 0 {
            return invalid("container.startup_timeout_secs must be positive".to_string());
        }

        Ok(())
    }

    /// Directory name shared by the archive, source, build and prefix paths.
    pub fn stem(&self) -> String {
        format!("geant4-v{}", self.version)
    }

    pub fn source_url(&self) -> String {
        self.source.url.clone().unwrap_or_else(|| {
            format!(
                "https://gitlab.cern.ch/geant4/geant4/-/archive/v{v}/geant4-v{v}.tar.gz",
                v = self.version
            )
        })
    }

    pub fn git_tag(&self) -> String {
        format!("v{}", self.version)
    }

    pub fn layout(&self) -> Layout {
        let root = &self.install_root;
        let stem = self.stem();
        Layout {
            install_root: root.clone(),
            archive: root.join(self.archive_name()),
            source_dir: root.join(&stem),
            build_dir: root.join(format!("{stem}-build")),
            prefix: root.join(format!("{stem}-install")),
            receipt: root.join("g4up.lock"),
        }
    }

    /// Archive file name, kept from the URL when it names a known archive type.
    fn archive_name(&self) -> String {
        Url::parse(&self.source_url())
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|segments| segments.last().map(str::to_string))
            })
            .filter(|name| ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
            .unwrap_or_else(|| format!("{}.tar.gz", self.stem()))
    }

    pub fn jobs(&self) -> usize {
        self.jobs
            .filter(|jobs| *jobs > 0)
            .unwrap_or_else(host::cpu_count)
    }

    pub fn image_tag(&self) -> String {
        self.container
            .tag
            .clone()
            .unwrap_or_else(|| format!("g4up/geant4:{}", self.version))
    }

    /// Shell startup file that receives the environment block. Under sudo
    /// this is the invoking user's file, not root's.
    pub fn profile_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.profile.path {
            return Ok(path.clone());
        }
        let home = match host::sudo_account() {
            Some(account) => account.home,
            None => xdg::home_dir()?,
        };
        Ok(self.profile.shell.rc_file(&home))
    }
}

/// First character that would break out of a double-quoted shell string.
fn unquotable_char(path: &Path) -> Option<char> {
    path.to_string_lossy()
        .chars()
        .find(|c| matches!(c, '"' | '`' | '$' | '\\' | '\n' | '\r'))
}

fn expand_path(path: &Path) -> Result<PathBuf, ProvisionError> {
    let raw = path.to_string_lossy();
    shellexpand::full(&raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|err| ProvisionError::InvalidConfig(format!("cannot expand {raw:?}: {err}")))
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

fn enabled() -> bool {
    true
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_install_root() -> PathBuf {
    PathBuf::from(DEFAULT_INSTALL_ROOT)
}

fn default_packages() -> Vec<String> {
    DEFAULT_PACKAGES.iter().map(|name| name.to_string()).collect()
}

fn default_git_url() -> String {
    DEFAULT_GIT_URL.to_string()
}

fn default_connections() -> u32 {
    DEFAULT_CONNECTIONS
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}

fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECS
}
