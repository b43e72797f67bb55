// Common library: snippet compilation, bucket storage, synchronization and scheduling

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod executor;
pub mod ledger;
pub mod models;
pub mod packages;
pub mod sandbox;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod telemetry;
