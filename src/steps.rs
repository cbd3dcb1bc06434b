//! The ordered units of work that make up a bare-metal install.

use std::fmt;

use crate::config::{Layout, ProvisionConfig, SourceMethod};
use crate::runner::CommandLine;

/// Phase of the provisioning sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Preflight,
    Dependencies,
    Workspace,
    Source,
    Configure,
    Build,
    Install,
    Environment,
    Cleanup,
}

impl Stage {
    /// Short label for status output.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Preflight => "Preflight",
            Stage::Dependencies => "Packages",
            Stage::Workspace => "Workspace",
            Stage::Source => "Source",
            Stage::Configure => "Configure",
            Stage::Build => "Build",
            Stage::Install => "Install",
            Stage::Environment => "Environment",
            Stage::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An external command run as part of the sequence. Zero exit status is
/// success; anything else aborts the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub stage: Stage,
    pub name: String,
    pub command: CommandLine,
}

impl BuildStep {
    fn new(stage: Stage, name: impl Into<String>, command: CommandLine) -> Self {
        Self {
            stage,
            name: name.into(),
            command,
        }
    }
}

pub fn dependency_steps(config: &ProvisionConfig) -> Vec<BuildStep> {
    let update = CommandLine::new("apt-get")
        .arg("update")
        .env("DEBIAN_FRONTEND", "noninteractive");
    let install = CommandLine::new("apt-get")
        .args(["install", "-y", "--no-install-recommends"])
        .args(config.packages.iter().cloned())
        .env("DEBIAN_FRONTEND", "noninteractive");

    vec![
        BuildStep::new(Stage::Dependencies, "Refreshing package index", update),
        BuildStep::new(
            Stage::Dependencies,
            format!("Installing {} packages", config.packages.len()),
            install,
        ),
    ]
}

/// aria2c invocation for the archive; `None` for other source methods.
pub fn download_step(config: &ProvisionConfig, layout: &Layout) -> Option<BuildStep> {
    if config.source.method != SourceMethod::Aria2c {
        return None;
    }

    let file_name = layout
        .archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let connections = config.source.connections.to_string();

    let command = CommandLine::new("aria2c")
        .args(["--continue=true", "--allow-overwrite=true", "--console-log-level=warn"])
        .arg(format!("--max-connection-per-server={connections}"))
        .arg(format!("--split={connections}"))
        .arg("--dir")
        .path_arg(&layout.install_root)
        .arg("--out")
        .arg(file_name)
        .arg(config.source_url());

    Some(BuildStep::new(
        Stage::Source,
        format!("Downloading {}", config.source_url()),
        command,
    ))
}

pub fn configure_step(config: &ProvisionConfig, layout: &Layout) -> BuildStep {
    let command = CommandLine::new("cmake")
        .arg("-S")
        .path_arg(&layout.source_dir)
        .arg("-B")
        .path_arg(&layout.build_dir)
        .arg(format!("-DCMAKE_INSTALL_PREFIX={}", layout.prefix.display()))
        .args(config.build.cmake_definitions());

    BuildStep::new(Stage::Configure, "Generating build system", command)
}

pub fn compile_step(layout: &Layout, jobs: usize) -> BuildStep {
    let command = CommandLine::new("make")
        .arg(format!("-j{jobs}"))
        .current_dir(&layout.build_dir);

    BuildStep::new(Stage::Build, format!("Compiling with {jobs} jobs"), command)
}

pub fn install_step(layout: &Layout) -> BuildStep {
    let command = CommandLine::new("make")
        .arg("install")
        .current_dir(&layout.build_dir);

    BuildStep::new(
        Stage::Install,
        format!("Installing to {}", layout.prefix.display()),
        command,
    )
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub stage: Stage,
    pub description: String,
}

impl PlannedStep {
    fn new(stage: Stage, description: impl Into<String>) -> Self {
        Self {
            stage,
            description: description.into(),
        }
    }

    fn command(step: BuildStep) -> Self {
        Self::new(step.stage, step.command.to_string())
    }
}

/// Everything `install` would do, without doing it.
pub fn plan(config: &ProvisionConfig, skip_dependencies: bool) -> Vec<PlannedStep> {
    let layout = config.layout();
    let mut planned = vec![PlannedStep::new(
        Stage::Preflight,
        "require effective uid 0",
    )];

    if skip_dependencies {
        planned.push(PlannedStep::new(Stage::Dependencies, "skipped (--skip-deps)"));
    } else {
        planned.extend(dependency_steps(config).into_iter().map(PlannedStep::command));
    }

    planned.push(PlannedStep::new(
        Stage::Workspace,
        format!("create {}", layout.install_root.display()),
    ));

    match config.source.method {
        SourceMethod::Git => planned.push(PlannedStep::new(
            Stage::Source,
            format!(
                "clone {} at {} into {}",
                config.source.git_url,
                config.git_tag(),
                layout.source_dir.display()
            ),
        )),
        SourceMethod::Http => planned.push(PlannedStep::new(
            Stage::Source,
            format!(
                "fetch {} to {} (reused if present)",
                config.source_url(),
                layout.archive.display()
            ),
        )),
        SourceMethod::Aria2c => {
            if let Some(step) = download_step(config, &layout) {
                planned.push(PlannedStep::command(step));
            }
        }
    }
    if config.source.method != SourceMethod::Git {
        planned.push(PlannedStep::new(
            Stage::Source,
            format!(
                "extract {} to {}",
                layout.archive.display(),
                layout.source_dir.display()
            ),
        ));
    }

    planned.push(PlannedStep::command(configure_step(config, &layout)));
    planned.push(PlannedStep::command(compile_step(&layout, config.jobs())));
    planned.push(PlannedStep::command(install_step(&layout)));
    planned.push(PlannedStep::new(
        Stage::Environment,
        "write managed block to shell profile",
    ));

    let mut removals = Vec::new();
    if !config.cleanup.keep_archive && config.source.method != SourceMethod::Git {
        removals.push(layout.archive.display().to_string());
    }
    if !config.cleanup.keep_source_dir {
        removals.push(layout.source_dir.display().to_string());
    }
    if !config.cleanup.keep_build_dir {
        removals.push(layout.build_dir.display().to_string());
    }
    if !removals.is_empty() {
        planned.push(PlannedStep::new(
            Stage::Cleanup,
            format!("remove {}", removals.join(", ")),
        ));
    }

    planned
}
