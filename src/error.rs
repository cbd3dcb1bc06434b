use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// How an external command ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The process exited with a non-zero status.
    Exit(i32),
    /// The process was killed by a signal.
    Signal,
    /// The process could not be started at all.
    Spawn(String),
}

/// A failed external command, with the tail of its output for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub command: String,
    pub reason: FailureReason,
    pub output: String,
}

impl CommandFailure {
    pub fn exit_code(&self) -> Option<i32> {
        match self.reason {
            FailureReason::Exit(code) => Some(code),
            _ => None,
        }
    }

    /// One-line description without the captured output.
    pub fn summary(&self) -> String {
        match &self.reason {
            FailureReason::Exit(code) => format!("`{}` exited with status {code}", self.command),
            FailureReason::Signal => format!("`{}` was terminated by a signal", self.command),
            FailureReason::Spawn(err) => format!("`{}` could not be started: {err}", self.command),
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())?;
        let tail = self.output.trim_end();
        if !tail.is_empty() {
            write!(f, "\n--- last output ---\n{tail}")?;
        }
        Ok(())
    }
}

/// Underlying cause of a failed provisioning step.
#[derive(Debug)]
pub enum Cause {
    Command(CommandFailure),
    Io(io::Error),
    Message(String),
}

impl Cause {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Cause::Command(failure) => failure.exit_code(),
            _ => None,
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Command(failure) => failure.fmt(f),
            Cause::Io(err) => err.fmt(f),
            Cause::Message(msg) => f.write_str(msg),
        }
    }
}

impl From<CommandFailure> for Cause {
    fn from(failure: CommandFailure) -> Self {
        Cause::Command(failure)
    }
}

impl From<io::Error> for Cause {
    fn from(err: io::Error) -> Self {
        Cause::Io(err)
    }
}

/// Errors of the bare-metal provisioning sequence.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("administrative privileges are required (running as '{user}'); re-run with sudo")]
    Permission { user: String },

    #[error("dependency installation failed: {0}")]
    DependencyInstall(Cause),

    #[error("filesystem error at {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to download {url}: {cause}")]
    Download { url: String, cause: Cause },

    #[error("failed to extract {archive:?}: {cause}")]
    Extraction { archive: PathBuf, cause: Cause },

    #[error("build configuration failed: {0}")]
    Configuration(Cause),

    #[error("compilation failed: {0}")]
    Build(Cause),

    #[error("installation failed: {0}")]
    Install(Cause),
}

impl ProvisionError {
    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ProvisionError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Exit status of the external tool behind this error, if one failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProvisionError::DependencyInstall(cause)
            | ProvisionError::Configuration(cause)
            | ProvisionError::Build(cause)
            | ProvisionError::Install(cause) => cause.exit_code(),
            ProvisionError::Download { cause, .. } | ProvisionError::Extraction { cause, .. } => {
                cause.exit_code()
            }
            _ => None,
        }
    }
}

/// Errors of the containerized profile.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("invalid image settings: {0}")]
    Settings(String),

    #[error("failed to prepare build context at {path:?}: {source}")]
    Context {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image build failed: {0}")]
    ImageBuild(Cause),

    #[error("failed to inspect {target}: {cause}")]
    Inspect { target: String, cause: Cause },

    #[error("container failed to start: {0}")]
    Run(Cause),

    #[error("endpoint {addr} was not reachable within {}s", timeout.as_secs())]
    EndpointTimeout { addr: SocketAddr, timeout: Duration },

    #[error("failed to remove container {id}: {cause}")]
    Stop { id: String, cause: Cause },
}

impl ContainerError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ContainerError::ImageBuild(cause) | ContainerError::Run(cause) => cause.exit_code(),
            ContainerError::Inspect { cause, .. } | ContainerError::Stop { cause, .. } => {
                cause.exit_code()
            }
            _ => None,
        }
    }
}
