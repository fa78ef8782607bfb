pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod repairer;
pub mod store;
pub mod validate;
pub mod wal;
