// Public API
pub mod cli;
pub mod commands;
pub mod ui;

// Provisioning
pub mod config;
pub mod container;
pub mod environment;
pub mod error;
pub mod host;
pub mod provisioner;
pub mod receipt;
pub mod runner;
pub mod source;
pub mod state;
pub mod steps;

mod util;

// Re-export main types
pub use config::{Layout, ProvisionConfig};
pub use container::{ContainerHandle, ContainerProvisioner, Endpoint, ImageHandle, ImageSpec, PortMapping};
pub use environment::{EnvironmentRegistration, Shell};
pub use error::{ContainerError, ProvisionError};
pub use provisioner::{InstalledPaths, Provisioner};
pub use receipt::Receipt;
pub use runner::{CommandLine, CommandRunner, SystemRunner};
pub use state::ProvisionState;
pub use steps::{BuildStep, Stage};
