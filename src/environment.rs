//! Shell environment registration for an installed toolkit.
//!
//! Directives live in a single managed block of the user's shell startup
//! file. Writing the block replaces any previous copy, so registering twice
//! leaves the file exactly as registering once.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const BLOCK_START: &str = "# >>> g4up geant4 >>>";
pub const BLOCK_END: &str = "# <<< g4up geant4 <<<";

/// Shell type for environment generation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    #[default]
    Bash,
    Zsh,
    Fish,
}

impl Shell {
    pub fn as_str(self) -> &'static str {
        match self {
            Shell::Zsh => "zsh",
            Shell::Bash => "bash",
            Shell::Fish => "fish",
        }
    }

    /// Interactive startup file for this shell under `home`.
    pub fn rc_file(self, home: &Path) -> PathBuf {
        match self {
            Shell::Bash => home.join(".bashrc"),
            Shell::Zsh => home.join(".zshrc"),
            Shell::Fish => home.join(".config/fish/config.fish"),
        }
    }
}

/// A single environment-setup line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Source a POSIX activation script.
    Source(PathBuf),
    /// Set a variable.
    Export { key: String, value: String },
    /// Put a directory in front of a colon-separated search path.
    PrependPath { key: String, dir: PathBuf },
}

impl Directive {
    /// Identity used to keep the set free of duplicates.
    fn key(&self) -> String {
        match self {
            Directive::Source(path) => format!("source:{}", path.display()),
            Directive::Export { key, .. } => format!("export:{key}"),
            Directive::PrependPath { key, dir } => format!("path:{key}:{}", dir.display()),
        }
    }

    pub fn render(&self, shell: Shell) -> String {
        match (self, shell) {
            (Directive::Source(path), Shell::Bash | Shell::Zsh) => {
                format!("source \"{}\"", path.display())
            }
            // geant4.sh is POSIX-only; fish gets the variables below instead.
            (Directive::Source(path), Shell::Fish) => {
                format!("# {} requires a POSIX shell", path.display())
            }
            (Directive::Export { key, value }, Shell::Bash | Shell::Zsh) => {
                format!("export {key}=\"{value}\"")
            }
            (Directive::Export { key, value }, Shell::Fish) => {
                format!("set -gx {key} \"{value}\"")
            }
            (Directive::PrependPath { key, dir }, Shell::Bash | Shell::Zsh) => format!(
                "export {key}=\"{}${{{key}:+:${key}}}\"",
                dir.display()
            ),
            (Directive::PrependPath { key, dir }, Shell::Fish) => {
                format!("set -gx {key} \"{}\" ${key}", dir.display())
            }
        }
    }
}

/// What a profile write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Appended,
    Replaced,
    Unchanged,
}

/// Keyed set of directives persisted to the shell profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentRegistration {
    directives: Vec<Directive>,
}

impl EnvironmentRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four Geant4 directives for an install prefix.
    pub fn for_install(activation_script: &Path, prefix: &Path, include_dir: &Path, lib_dir: &Path) -> Self {
        let mut registration = Self::new();
        registration.insert(Directive::Source(activation_script.to_path_buf()));
        registration.insert(Directive::Export {
            key: "G4INSTALL".to_string(),
            value: prefix.display().to_string(),
        });
        registration.insert(Directive::PrependPath {
            key: "CPLUS_INCLUDE_PATH".to_string(),
            dir: include_dir.to_path_buf(),
        });
        registration.insert(Directive::PrependPath {
            key: "LD_LIBRARY_PATH".to_string(),
            dir: lib_dir.to_path_buf(),
        });
        registration
    }

    /// Add a directive, replacing one with the same key in place.
    pub fn insert(&mut self, directive: Directive) {
        let key = directive.key();
        match self.directives.iter_mut().find(|existing| existing.key() == key) {
            Some(existing) => *existing = directive,
            None => self.directives.push(directive),
        }
    }

    /// Directive lines only, as printed by `g4up env`.
    pub fn format_for_shell(&self, shell: Shell) -> String {
        self.directives
            .iter()
            .map(|directive| directive.render(shell))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Directive lines wrapped in the managed-block markers.
    pub fn managed_block(&self, shell: Shell) -> String {
        format!("{BLOCK_START}\n{}\n{BLOCK_END}\n", self.format_for_shell(shell))
    }

    /// Write the managed block into `profile`, replacing an earlier copy.
    pub fn write_to(&self, profile: &Path, shell: Shell) -> io::Result<RegistrationOutcome> {
        let existing = match fs::read_to_string(profile) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };

        let block = self.managed_block(shell);
        let (updated, outcome) = match find_block(&existing)? {
            Some((start, end)) => {
                if existing[start..end] == block {
                    return Ok(RegistrationOutcome::Unchanged);
                }
                let mut updated = String::with_capacity(existing.len() + block.len());
                updated.push_str(&existing[..start]);
                updated.push_str(&block);
                updated.push_str(&existing[end..]);
                (updated, RegistrationOutcome::Replaced)
            }
            None => {
                let mut updated = existing.clone();
                if !updated.is_empty() && !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push_str(&block);
                (updated, RegistrationOutcome::Appended)
            }
        };

        if let Some(parent) = profile.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(profile, updated)?;
        Ok(outcome)
    }

    /// Apply variable directives to this process so later steps see them.
    /// `Source` directives cannot be applied in-process and are skipped.
    pub fn apply_to_process(&self) {
        for directive in &self.directives {
            match directive {
                Directive::Source(path) => {
                    tracing::debug!(script = %path.display(), "activation script takes effect in new shells");
                }
                Directive::Export { key, value } => env::set_var(key, value),
                Directive::PrependPath { key, dir } => {
                    let current = env::var_os(key).unwrap_or_default();
                    let mut paths: Vec<PathBuf> = env::split_paths(&current).collect();
                    if paths.iter().any(|existing| existing == dir) {
                        continue;
                    }
                    paths.insert(0, dir.clone());
                    paths.retain(|path| !path.as_os_str().is_empty());
                    if let Ok(joined) = env::join_paths(paths) {
                        env::set_var(key, joined);
                    }
                }
            }
        }
    }
}

/// True if `profile` already holds a managed block.
pub fn is_registered(profile: &Path) -> io::Result<bool> {
    match fs::read_to_string(profile) {
        Ok(contents) => Ok(find_block(&contents)?.is_some()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Byte range of the managed block, including the end marker's newline.
fn find_block(contents: &str) -> io::Result<Option<(usize, usize)>> {
    let Some(start) = line_offset(contents, BLOCK_START, 0) else {
        return Ok(None);
    };
    let Some(end_marker) = line_offset(contents, BLOCK_END, start) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("found '{BLOCK_START}' without a matching '{BLOCK_END}'"),
        ));
    };

    let mut end = end_marker + BLOCK_END.len();
    if contents[end..].starts_with('\n') {
        end += 1;
    }
    Ok(Some((start, end)))
}

/// Offset of the first line at or after `from` that equals `marker`.
fn line_offset(contents: &str, marker: &str, from: usize) -> Option<usize> {
    let mut offset = 0;
    for line in contents.split_inclusive('\n') {
        if offset >= from && line.trim_end_matches(['\n', '\r']) == marker {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}
