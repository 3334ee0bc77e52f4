pub mod chat;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod store;
pub mod timerange;
pub mod wal;
pub mod wire;
