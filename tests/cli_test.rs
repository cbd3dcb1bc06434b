use assert_cmd::Command;
use g4up::environment::Shell;
use g4up::receipt::{EnvironmentEntry, Receipt, Toolkit};
use predicates::prelude::*;
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a config that keeps every path inside `temp`.
fn write_config(temp: &TempDir) -> PathBuf {
    let root = temp.path().join("geant4");
    let profile = temp.path().join("home").join(".bashrc");
    let config = format!(
        r#"version = "11.2.1"
install_root = "{}"

[profile]
shell = "bash"
path = "{}"
"#,
        root.display(),
        profile.display()
    );
    let path = temp.path().join("g4up.toml");
    fs::write(&path, config).unwrap();
    path
}

fn g4up(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("g4up").unwrap();
    cmd.env("XDG_CONFIG_HOME", temp.path().join("config"))
        .env("XDG_CACHE_HOME", temp.path().join("cache"))
        .env("HOME", temp.path().join("home"))
        .env("NO_COLOR", "1")
        .env_remove("G4UP_CONFIG")
        .env_remove("SUDO_USER")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_describes_commands() {
    let temp = TempDir::new().unwrap();
    g4up(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Geant4"))
        .stdout(predicate::str::contains("install"))
        .stdout(predicate::str::contains("image"));
}

#[test]
#[serial]
fn test_install_dry_run_prints_plan() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    g4up(&temp)
        .arg("--config")
        .arg(&config)
        .args(["install", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("apt-get install -y --no-install-recommends"))
        .stdout(predicate::str::contains("aria2c"))
        .stdout(predicate::str::contains("cmake -S"))
        .stdout(predicate::str::contains("make install"))
        .stdout(predicate::str::contains("# >>> g4up geant4 >>>"))
        .stdout(predicate::str::contains("export G4INSTALL="));

    // nothing is executed or created
    assert!(!temp.path().join("geant4").exists());
    assert!(!temp.path().join("home").join(".bashrc").exists());
}

#[test]
#[serial]
fn test_install_dry_run_skip_deps() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    g4up(&temp)
        .env("G4UP_CONFIG", &config)
        .args(["install", "--dry-run", "--skip-deps"])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped (--skip-deps)"))
        .stdout(predicate::str::contains("apt-get update").not());
}

#[test]
#[serial]
fn test_install_requires_root() {
    if g4up::host::is_privileged() {
        // a real install would start; nothing to assert without root dropped
        return;
    }

    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    g4up(&temp)
        .arg("--config")
        .arg(&config)
        .arg("install")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("administrative privileges"));

    assert!(!temp.path().join("geant4").exists());
}

#[test]
#[serial]
fn test_env_prints_directives_for_shell() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);
    let prefix = temp.path().join("geant4").join("geant4-v11.2.1-install");

    g4up(&temp)
        .arg("--config")
        .arg(&config)
        .arg("env")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "source \"{}\"",
            prefix.join("bin/geant4.sh").display()
        )))
        .stdout(predicate::str::contains("LD_LIBRARY_PATH"));

    g4up(&temp)
        .arg("--config")
        .arg(&config)
        .args(["env", "--shell", "fish"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "set -gx G4INSTALL \"{}\"",
            prefix.display()
        )));
}

#[test]
#[serial]
fn test_config_init_show_and_force() {
    let temp = TempDir::new().unwrap();
    let config_file = temp.path().join("config").join("g4up").join("config.toml");

    g4up(&temp)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    assert!(config_file.exists());

    g4up(&temp)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    g4up(&temp)
        .args(["config", "init", "--force"])
        .assert()
        .success();

    g4up(&temp)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("version = \"11.2.1\""))
        .stdout(predicate::str::contains("install_root = \"/opt/geant4\""));
}

#[test]
#[serial]
fn test_missing_explicit_config_fails() {
    let temp = TempDir::new().unwrap();

    g4up(&temp)
        .args(["--config", "/nonexistent/g4up.toml", "config", "show"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
#[serial]
fn test_unknown_config_key_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bad.toml");
    fs::write(&path, "version = \"11.2.1\"\ncolour = \"blue\"\n").unwrap();

    g4up(&temp)
        .arg("--config")
        .arg(&path)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
#[serial]
fn test_invalid_version_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bad.toml");
    fs::write(&path, "version = \"latest\"\n").unwrap();

    g4up(&temp)
        .arg("--config")
        .arg(&path)
        .args(["install", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
#[serial]
fn test_status_without_install() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    g4up(&temp)
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No Geant4 install recorded"))
        .stdout(predicate::str::contains("is not set up"));
}

fn record_install(root: &Path, profile: &Path) {
    let prefix = root.join("geant4-v11.2.1-install");
    fs::create_dir_all(prefix.join("lib")).unwrap();
    let receipt = Receipt::new(
        Toolkit {
            version: "11.2.1".to_string(),
            prefix: prefix.clone(),
            lib_dir: prefix.join("lib"),
        },
        EnvironmentEntry {
            shell: Shell::Bash,
            profile: profile.to_path_buf(),
        },
    );
    receipt.save(&root.join("g4up.lock")).unwrap();
}

#[test]
#[serial]
fn test_status_reports_receipt() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);
    let profile = temp.path().join("home").join(".bashrc");
    record_install(&temp.path().join("geant4"), &profile);
    fs::create_dir_all(profile.parent().unwrap()).unwrap();
    fs::write(
        &profile,
        "alias ll='ls -l'\n# >>> g4up geant4 >>>\nexport G4INSTALL=\"/x\"\n# <<< g4up geant4 <<<\n",
    )
    .unwrap();

    g4up(&temp)
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Geant4 11.2.1"))
        .stdout(predicate::str::contains("Shell bash"))
        .stdout(predicate::str::contains("has the Geant4 block"));
}

#[test]
#[serial]
fn test_check_validates_config() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    g4up(&temp)
        .arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("Geant4 11.2.1"));
}

#[test]
fn test_image_build_rejects_unknown_endpoint() {
    let temp = TempDir::new().unwrap();

    g4up(&temp)
        .args(["image", "build", "--endpoint", "rdp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value 'rdp'"));
}
