//! Port traits the domain drives; adapters implement them.

pub mod config_port;
pub mod data_port;
pub mod feed_port;
pub mod metadata_port;
pub mod sink_port;
