use super::PackageManager;
use crate::errors::PackageError;
use crate::telemetry::DEPS;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, instrument};

/// Bare package name of a requirement such as `flask==2.0` or `six>=1`
pub fn package_name(requirement: &str) -> &str {
    let requirement = requirement.trim();
    match requirement.find(|c: char| matches!(c, '=' | '<' | '>' | '~' | '!')) {
        Some(at) => requirement[..at].trim_end(),
        None => requirement,
    }
}

/// Requirements whose package is not installed, compared by package name.
///
/// The missing requirements are returned as written, version suffix included.
pub fn compute_missing(required: &BTreeSet<String>, installed: &BTreeSet<String>) -> BTreeSet<String> {
    let installed: BTreeSet<&str> = installed
        .iter()
        .map(String::as_str)
        .map(package_name)
        .collect();
    required
        .iter()
        .filter(|requirement| !installed.contains(package_name(requirement)))
        .cloned()
        .collect()
}

/// Parse a package listing into package names: one entry per line, blank
/// lines dropped, version suffixes stripped
pub fn parse_installed(listing: &str) -> BTreeSet<String> {
    listing
        .lines()
        .map(package_name)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Process-wide set of installed packages.
///
/// Readers get an immutable snapshot; writers swap the whole set.
#[derive(Debug, Default)]
pub struct DependencySet {
    installed: RwLock<Arc<BTreeSet<String>>>,
}

impl DependencySet {
    pub fn new(installed: BTreeSet<String>) -> Self {
        Self {
            installed: RwLock::new(Arc::new(installed)),
        }
    }

    pub async fn snapshot(&self) -> Arc<BTreeSet<String>> {
        self.installed.read().await.clone()
    }

    pub async fn replace(&self, installed: BTreeSet<String>) {
        *self.installed.write().await = Arc::new(installed);
    }
}

/// Computes and installs missing packages through a [`PackageManager`]
pub struct DependencyResolver {
    manager: Arc<dyn PackageManager>,
    settle_delay: Duration,
}

impl DependencyResolver {
    pub fn new(manager: Arc<dyn PackageManager>, settle_delay: Duration) -> Self {
        Self {
            manager,
            settle_delay,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Install every missing package with one package manager call
    #[instrument(skip(self, missing), fields(count = missing.len()))]
    pub async fn install(&self, missing: &BTreeSet<String>) -> Result<String, PackageError> {
        let packages: Vec<String> = missing.iter().cloned().collect();
        info!(target: DEPS, packages = ?packages, "Installing missing packages");

        match self.manager.install(&packages).await {
            Ok(log) => {
                info!(target: DEPS, "Package install log:\n{}", log);
                Ok(log)
            }
            Err(e) => {
                error!(target: DEPS, error = %e, packages = ?packages, "Package install failed");
                Err(e)
            }
        }
    }

    /// Wait for freshly installed packages to register
    pub async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    /// Re-query the installed package set
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<BTreeSet<String>, PackageError> {
        let listing = self.manager.list_installed().await.map_err(|e| {
            error!(target: DEPS, error = %e, "Failed to list installed packages");
            e
        })?;

        let installed = parse_installed(&listing);
        info!(target: DEPS, count = installed.len(), "Indexed installed packages");
        Ok(installed)
    }
}
