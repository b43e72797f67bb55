// Scheduler module: sync cadence and bucket cron triggers

pub mod engine;

pub use engine::{Scheduler, SchedulerConfig, SchedulerEngine};
