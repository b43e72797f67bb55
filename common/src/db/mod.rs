// Database layer module
// PostgreSQL connection pool and the job record repository

pub mod pool;
pub mod repositories;

pub use pool::DbPool;
