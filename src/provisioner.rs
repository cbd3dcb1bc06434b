//! Bare-metal install sequence.
//!
//! [`Provisioner::run`] drives every stage in order and stops at the first
//! failure. Nothing is rolled back; a failed run leaves the install root as
//! it was for inspection, and a rerun picks up the downloaded archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{Layout, ProvisionConfig, SourceMethod};
use crate::environment::{EnvironmentRegistration, RegistrationOutcome};
use crate::error::{Cause, ProvisionError};
use crate::host;
use crate::receipt::{EnvironmentEntry, Receipt, Toolkit};
use crate::runner::CommandRunner;
use crate::source;
use crate::state::ProvisionState;
use crate::steps::{self, BuildStep, Stage};
use crate::ui::{self, Progress};

/// Locations produced by a completed install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPaths {
    pub prefix: PathBuf,
    pub activation_script: PathBuf,
    pub include_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub profile: PathBuf,
}

pub struct Provisioner<'a> {
    runner: &'a dyn CommandRunner,
    privileged: bool,
    skip_dependencies: bool,
    state: ProvisionState,
}

impl<'a> Provisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            privileged: host::is_privileged(),
            skip_dependencies: false,
            state: ProvisionState::NotStarted,
        }
    }

    /// Override the detected privilege level.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn skip_dependencies(mut self, skip: bool) -> Self {
        self.skip_dependencies = skip;
        self
    }

    pub fn state(&self) -> &ProvisionState {
        &self.state
    }

    pub fn run(&mut self, config: &ProvisionConfig) -> Result<InstalledPaths, ProvisionError> {
        self.state = ProvisionState::NotStarted;
        let mut stage = Stage::Preflight;

        match self.execute(config, &mut stage) {
            Ok(paths) => Ok(paths),
            Err(err) => {
                tracing::error!(%stage, error = %err, "provisioning failed");
                if let Err(transition) = self.state.fail(stage, err.to_string()) {
                    tracing::debug!(%transition, "state already terminal");
                }
                Err(err)
            }
        }
    }

    fn execute(
        &mut self,
        config: &ProvisionConfig,
        stage: &mut Stage,
    ) -> Result<InstalledPaths, ProvisionError> {
        let layout = config.layout();

        *stage = Stage::Preflight;
        if !self.privileged {
            return Err(ProvisionError::Permission {
                user: host::current_user(),
            });
        }
        let profile = resolve_profile(config)?;

        *stage = Stage::Dependencies;
        self.install_dependencies(config)?;
        self.advance(ProvisionState::DependenciesInstalled);

        *stage = Stage::Workspace;
        prepare_workspace(&layout.install_root)?;

        *stage = Stage::Source;
        let progress = Progress::new(stage.label(), format!("Geant4 {}", config.version));
        if let Err(err) = source::acquire(config, &layout, self.runner) {
            progress.fail(&err);
            return Err(err);
        }
        if !layout.source_dir.is_dir() {
            let err = ProvisionError::Extraction {
                archive: layout.archive.clone(),
                cause: Cause::Message(format!("{:?} does not exist", layout.source_dir)),
            };
            progress.fail(&err);
            return Err(err);
        }
        progress.success(Some(format!("into {}", layout.source_dir.display())));
        self.advance(ProvisionState::SourceAcquired);

        *stage = Stage::Configure;
        self.run_step(&steps::configure_step(config, &layout))
            .map_err(ProvisionError::Configuration)?;
        self.advance(ProvisionState::Configured);

        *stage = Stage::Build;
        self.run_step(&steps::compile_step(&layout, config.jobs()))
            .map_err(ProvisionError::Build)?;
        self.advance(ProvisionState::Built);

        *stage = Stage::Install;
        self.run_step(&steps::install_step(&layout))
            .map_err(ProvisionError::Install)?;
        let lib_dir = verify_install(&layout)?;
        self.advance(ProvisionState::Installed);

        *stage = Stage::Environment;
        register_environment(config, &layout, &lib_dir, &profile)?;
        self.advance(ProvisionState::EnvironmentRegistered);

        *stage = Stage::Cleanup;
        cleanup(config, &layout);
        self.advance(ProvisionState::Complete);

        Ok(InstalledPaths {
            activation_script: layout.activation_script(),
            include_dir: layout.include_dir(),
            prefix: layout.prefix,
            lib_dir,
            profile,
        })
    }

    fn install_dependencies(&self, config: &ProvisionConfig) -> Result<(), ProvisionError> {
        if self.skip_dependencies {
            Progress::new(Stage::Dependencies.label(), "system packages").skip("--skip-deps");
            return Ok(());
        }
        if !host::is_apt_based() {
            ui::warn("host does not look Debian based; apt-get may be unavailable");
        }

        for step in steps::dependency_steps(config) {
            self.run_step(&step).map_err(ProvisionError::DependencyInstall)?;
        }
        Ok(())
    }

    fn run_step(&self, step: &BuildStep) -> Result<(), Cause> {
        tracing::debug!(stage = %step.stage, command = %step.command, "running step");
        let progress = Progress::new(step.stage.label(), step.name.clone());
        match self.runner.run(&step.command) {
            Ok(()) => {
                progress.success(None);
                Ok(())
            }
            Err(failure) => {
                progress.fail(failure.summary());
                Err(failure.into())
            }
        }
    }

    fn advance(&mut self, to: ProvisionState) {
        tracing::debug!(from = %self.state, %to, "state transition");
        if let Err(err) = self.state.advance_to(to) {
            tracing::warn!(%err, "unexpected state transition");
        }
    }
}

/// Locate the shell profile up front so a bad path fails before the build.
fn resolve_profile(config: &ProvisionConfig) -> Result<PathBuf, ProvisionError> {
    let profile = config.profile_path().map_err(|err| {
        ProvisionError::InvalidConfig(format!("cannot locate shell profile: {err:#}"))
    })?;
    if profile.is_dir() {
        return Err(ProvisionError::filesystem(
            &profile,
            io::Error::new(io::ErrorKind::InvalidInput, "shell profile is a directory"),
        ));
    }
    tracing::debug!(profile = %profile.display(), "shell profile");
    Ok(profile)
}

fn prepare_workspace(root: &Path) -> Result<(), ProvisionError> {
    if root.exists() && !root.is_dir() {
        return Err(ProvisionError::filesystem(
            root,
            io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
        ));
    }
    fs::create_dir_all(root).map_err(|err| ProvisionError::filesystem(root, err))?;
    tracing::debug!(root = %root.display(), "workspace ready");
    Ok(())
}

/// Confirm `make install` produced the tree the environment block points at,
/// returning the library directory.
fn verify_install(layout: &Layout) -> Result<PathBuf, ProvisionError> {
    let missing = |what: &str, path: &Path| {
        ProvisionError::Install(Cause::Message(format!(
            "{what} {path:?} missing after install"
        )))
    };

    let script = layout.activation_script();
    if !script.is_file() {
        return Err(missing("activation script", &script));
    }
    let include = layout.include_dir();
    if !include.is_dir() {
        return Err(missing("header directory", &include));
    }

    find_lib_dir(&layout.prefix).ok_or_else(|| missing("library directory", &layout.prefix.join("lib")))
}

/// `lib` or `lib64` under `prefix`, whichever holds the Geant4 libraries.
pub fn find_lib_dir(prefix: &Path) -> Option<PathBuf> {
    ["lib", "lib64"]
        .iter()
        .map(|name| prefix.join(name))
        .filter(|dir| dir.is_dir())
        .find(|dir| {
            WalkDir::new(dir)
                .max_depth(1)
                .into_iter()
                .filter_map(Result::ok)
                .any(|entry| entry.file_name().to_string_lossy().starts_with("libG4"))
        })
}

fn register_environment(
    config: &ProvisionConfig,
    layout: &Layout,
    lib_dir: &Path,
    profile: &Path,
) -> Result<(), ProvisionError> {
    let shell = config.profile.shell;
    let registration = EnvironmentRegistration::for_install(
        &layout.activation_script(),
        &layout.prefix,
        &layout.include_dir(),
        lib_dir,
    );

    let created = host::missing_paths(profile);
    let outcome = registration
        .write_to(profile, shell)
        .map_err(|err| ProvisionError::filesystem(profile, err))?;
    if config.profile.path.is_none() && !created.is_empty() {
        if let Some(account) = host::sudo_account() {
            if let Err(err) = host::hand_over(&created, &account) {
                tracing::warn!(user = %account.name, error = %err, "failed to chown shell profile");
                ui::warn(format!("{} is owned by root: {err}", profile.display()));
            }
        }
    }
    let verb = match outcome {
        RegistrationOutcome::Appended => "Added",
        RegistrationOutcome::Replaced => "Updated",
        RegistrationOutcome::Unchanged => "Kept",
    };
    ui::success(Stage::Environment.label(), format!("{verb} Geant4 block in {}", profile.display()));
    registration.apply_to_process();

    let receipt = Receipt::new(
        Toolkit {
            version: config.version.clone(),
            prefix: layout.prefix.clone(),
            lib_dir: lib_dir.to_path_buf(),
        },
        EnvironmentEntry {
            shell,
            profile: profile.to_path_buf(),
        },
    );
    if let Err(err) = receipt.save(&layout.receipt) {
        tracing::warn!(error = %err, "failed to write install receipt");
        ui::warn(format!("install receipt not written: {err:#}"));
    }
    Ok(())
}

/// Remove intermediate artifacts. Failures are reported and otherwise ignored.
fn cleanup(config: &ProvisionConfig, layout: &Layout) {
    let mut targets: Vec<&Path> = Vec::new();
    if !config.cleanup.keep_archive && config.source.method != SourceMethod::Git {
        targets.push(&layout.archive);
    }
    if !config.cleanup.keep_source_dir {
        targets.push(&layout.source_dir);
    }
    if !config.cleanup.keep_build_dir {
        targets.push(&layout.build_dir);
    }

    let mut removed = 0;
    for target in targets {
        let result = if target.is_dir() {
            fs::remove_dir_all(target)
        } else {
            fs::remove_file(target)
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %target.display(), error = %err, "cleanup failed");
                ui::warn(format!("could not remove {}: {err}", target.display()));
            }
        }
    }
    if removed > 0 {
        ui::success(Stage::Cleanup.label(), format!("Removed {removed} intermediate paths"));
    }
}
