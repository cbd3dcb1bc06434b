use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::environment::Shell;

const RECEIPT_VERSION: u32 = 1;

/// Install receipt written next to the toolkit (similar to Cargo.lock).
/// Records what a completed run produced so `status` can report it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Version of the receipt format
    version: u32,
    pub metadata: Metadata,
    pub toolkit: Toolkit,
    pub environment: EnvironmentEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// When the install finished (RFC 3339)
    pub installed_at: String,
    /// g4up version that performed it
    pub provisioner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolkit {
    pub version: String,
    pub prefix: PathBuf,
    pub lib_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    pub shell: Shell,
    pub profile: PathBuf,
}

impl Receipt {
    pub fn new(toolkit: Toolkit, environment: EnvironmentEntry) -> Self {
        Self {
            version: RECEIPT_VERSION,
            metadata: Metadata {
                installed_at: chrono::Utc::now().to_rfc3339(),
                provisioner: env!("CARGO_PKG_VERSION").to_string(),
            },
            toolkit,
            environment,
        }
    }

    /// Load the receipt, or `None` when nothing has been installed yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read receipt from {:?}", path))?;

        let receipt: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse receipt from {:?}", path))?;
        if receipt.version > RECEIPT_VERSION {
            anyhow::bail!(
                "receipt {:?} has format {}, newer than this g4up understands ({})",
                path,
                receipt.version,
                RECEIPT_VERSION
            );
        }
        Ok(Some(receipt))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create receipt directory {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize receipt")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write receipt to {:?}", path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Receipt {
        Receipt::new(
            Toolkit {
                version: "11.2.1".to_string(),
                prefix: PathBuf::from("/opt/geant4/geant4-v11.2.1-install"),
                lib_dir: PathBuf::from("/opt/geant4/geant4-v11.2.1-install/lib"),
            },
            EnvironmentEntry {
                shell: Shell::Bash,
                profile: PathBuf::from("/root/.bashrc"),
            },
        )
    }

    #[test]
    fn test_receipt_new() {
        let receipt = sample();
        assert_eq!(receipt.version, RECEIPT_VERSION);
        assert!(!receipt.metadata.installed_at.is_empty());
        assert_eq!(receipt.metadata.provisioner, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_receipt_save_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("g4up.lock");

        let receipt = sample();
        receipt.save(&path).unwrap();

        let loaded = Receipt::load(&path).unwrap().unwrap();
        assert_eq!(loaded, receipt);
        assert!(fs::read_to_string(&path).unwrap().contains("shell = \"bash\""));
    }

    #[test]
    fn test_receipt_missing_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(Receipt::load(&temp.path().join("g4up.lock")).unwrap().is_none());
    }

    #[test]
    fn test_receipt_from_newer_release_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("g4up.lock");
        let mut receipt = sample();
        receipt.version = RECEIPT_VERSION + 1;
        receipt.save(&path).unwrap();

        let err = Receipt::load(&path).unwrap_err();
        assert!(err.to_string().contains("newer than this g4up"));
    }

    #[test]
    fn test_receipt_garbage_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("g4up.lock");
        fs::write(&path, "version = [").unwrap();
        assert!(Receipt::load(&path).is_err());
    }
}
