// Repository layer for database operations

pub mod job;

pub use job::JobRecordRepository;
