//! Concrete adapter implementations for ports.

pub mod calendar;
pub mod csv_adapter;
pub mod csv_feed;
pub mod file_config_adapter;
pub mod queued_sink;
#[cfg(feature = "sqlite")]
pub mod sqlite_adapter;
pub mod symbol_master;
