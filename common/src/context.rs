// Process-wide state shared by the sync coordinator and the execution aggregator

use crate::packages::DependencySet;
use crate::store::BucketStore;
use std::collections::BTreeSet;

/// Explicit application context, built once at startup and shared by `Arc`.
#[derive(Debug, Default)]
pub struct AppContext {
    pub store: BucketStore,
    pub dependencies: DependencySet,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose dependency set starts from a known listing
    pub fn with_installed(installed: BTreeSet<String>) -> Self {
        Self {
            store: BucketStore::new(),
            dependencies: DependencySet::new(installed),
        }
    }
}
