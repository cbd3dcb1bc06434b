//! Source acquisition: fetch the release and lay out the source tree.

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::Archive;
use xz2::read::XzDecoder;

use crate::config::{Layout, ProvisionConfig, SourceMethod};
use crate::error::{Cause, ProvisionError};
use crate::runner::CommandRunner;
use crate::steps;

const DEFAULT_USER_AGENT: &str = concat!("g4up/", env!("CARGO_PKG_VERSION"));

/// Make `layout.source_dir` hold the configured release.
pub fn acquire(
    config: &ProvisionConfig,
    layout: &Layout,
    runner: &dyn CommandRunner,
) -> Result<(), ProvisionError> {
    if config.source.method == SourceMethod::Git {
        return clone_tag(&config.source.git_url, &config.git_tag(), &layout.source_dir);
    }

    let reused = archive_present(&layout.archive);
    if reused {
        tracing::info!(archive = %layout.archive.display(), "reusing downloaded archive");
    } else {
        fetch_archive(config, layout, runner)?;
    }

    let result = unpack_source(&layout.archive, &layout.extract_dir(), &layout.source_dir);
    if result.is_err() && reused {
        // the next run downloads a fresh copy
        if let Err(err) = fs::remove_file(&layout.archive) {
            tracing::warn!(archive = %layout.archive.display(), %err, "failed to discard archive");
        }
    }
    result
}

/// aria2c's control file, left next to the archive while a download is
/// unfinished.
fn control_file(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".aria2");
    PathBuf::from(name)
}

fn archive_present(path: &Path) -> bool {
    if control_file(path).exists() {
        return false;
    }
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn fetch_archive(
    config: &ProvisionConfig,
    layout: &Layout,
    runner: &dyn CommandRunner,
) -> Result<(), ProvisionError> {
    let url = config.source_url();
    tracing::info!(%url, method = ?config.source.method, "downloading source archive");

    match steps::download_step(config, layout) {
        Some(step) => runner
            .run(&step.command)
            .map_err(|failure| ProvisionError::Download {
                url: url.clone(),
                cause: failure.into(),
            })?,
        None => {
            remove_file_if_present(&control_file(&layout.archive)).map_err(|err| {
                ProvisionError::Download {
                    url: url.clone(),
                    cause: err.into(),
                }
            })?;
            download_http(&url, &layout.archive).map_err(|cause| ProvisionError::Download {
                url: url.clone(),
                cause,
            })?
        }
    }

    if !archive_present(&layout.archive) {
        return Err(ProvisionError::Download {
            url,
            cause: Cause::Message(format!(
                "downloader reported success but {:?} is missing or empty",
                layout.archive
            )),
        });
    }
    Ok(())
}

/// Stream `url` into `dest` through a temporary file.
pub fn download_http(url: &str, dest: &Path) -> Result<(), Cause> {
    let http = Client::builder()
        .build()
        .map_err(|err| Cause::Message(format!("failed to build HTTP client: {err}")))?;

    let mut response = http
        .get(url)
        .header(USER_AGENT, DEFAULT_USER_AGENT)
        .send()
        .map_err(|err| Cause::Message(err.to_string()))?;

    if !response.status().is_success() {
        return Err(Cause::Message(format!(
            "server returned {}",
            response.status()
        )));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = dest.with_extension("download");
    let mut file = File::create(&temp_path)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])?;
    }
    file.flush()?;

    fs::rename(&temp_path, dest)?;
    Ok(())
}

/// Extract `archive` and move its single top-level directory to `source_dir`,
/// replacing any previous tree there.
pub fn unpack_source(
    archive: &Path,
    scratch: &Path,
    source_dir: &Path,
) -> Result<(), ProvisionError> {
    let extraction = |cause: Cause| ProvisionError::Extraction {
        archive: archive.to_path_buf(),
        cause,
    };

    remove_dir_if_present(scratch).map_err(|err| extraction(err.into()))?;
    fs::create_dir_all(scratch).map_err(|err| extraction(err.into()))?;

    extract_archive(archive, scratch).map_err(extraction)?;

    let top = single_top_level_dir(scratch).map_err(extraction)?;

    remove_dir_if_present(source_dir).map_err(|err| extraction(err.into()))?;
    fs::rename(&top, source_dir).map_err(|err| extraction(err.into()))?;
    remove_dir_if_present(scratch).map_err(|err| extraction(err.into()))?;

    tracing::info!(source = %source_dir.display(), "source tree ready");
    Ok(())
}

pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<(), Cause> {
    let filename = archive_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let file = File::open(archive_path)?;
    if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        Archive::new(GzDecoder::new(file)).unpack(dest)?;
    } else if filename.ends_with(".tar.xz") || filename.ends_with(".txz") {
        Archive::new(XzDecoder::new(file)).unpack(dest)?;
    } else if filename.ends_with(".tar") {
        Archive::new(file).unpack(dest)?;
    } else {
        return Err(Cause::Message(format!(
            "unsupported archive type '{filename}'"
        )));
    }
    Ok(())
}

fn single_top_level_dir(root: &Path) -> Result<PathBuf, Cause> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        } else {
            return Err(Cause::Message(format!(
                "archive has a top-level file {:?}; expected a single source directory",
                entry.file_name()
            )));
        }
    }

    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        0 => Err(Cause::Message("archive is empty".to_string())),
        n => Err(Cause::Message(format!(
            "archive has {n} top-level directories; expected one"
        ))),
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Clone `url` and check out `tag` (detached) into `dest`.
pub fn clone_tag(url: &str, tag: &str, dest: &Path) -> Result<(), ProvisionError> {
    let download = |msg: String| ProvisionError::Download {
        url: url.to_string(),
        cause: Cause::Message(msg),
    };

    remove_dir_if_present(dest).map_err(|err| ProvisionError::filesystem(dest, err))?;

    tracing::info!(%url, %tag, dest = %dest.display(), "cloning source");
    let repo = git2::Repository::clone(url, dest)
        .map_err(|err| download(format!("clone failed: {err}")))?;

    let object = repo
        .revparse_single(&format!("refs/tags/{tag}"))
        .map_err(|err| download(format!("tag '{tag}' not found: {err}")))?;
    let commit = object
        .peel_to_commit()
        .map_err(|err| download(format!("tag '{tag}' does not point at a commit: {err}")))?;

    repo.checkout_tree(commit.as_object(), Some(git2::build::CheckoutBuilder::new().force()))
        .map_err(|err| download(format!("checkout of '{tag}' failed: {err}")))?;
    repo.set_head_detached(commit.id())
        .map_err(|err| download(format!("failed to move HEAD to '{tag}': {err}")))?;

    Ok(())
}
