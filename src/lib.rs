pub mod clock;
pub mod config;
pub mod engine;
pub mod inventory;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod sql;
pub mod store;
pub mod tenant;
pub mod wal;
pub mod wire;
