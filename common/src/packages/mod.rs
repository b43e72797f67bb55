// Package management: external package manager and dependency resolution

pub mod command;
pub mod resolver;

pub use command::CommandPackageManager;
pub use resolver::{
    compute_missing, package_name, parse_installed, DependencyResolver, DependencySet,
};

use crate::errors::PackageError;
use async_trait::async_trait;

/// External package manager collaborator
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Install a batch of packages with one invocation, returning its log
    async fn install(&self, packages: &[String]) -> Result<String, PackageError>;

    /// Newline-delimited identifiers of installed packages
    async fn list_installed(&self) -> Result<String, PackageError>;
}
