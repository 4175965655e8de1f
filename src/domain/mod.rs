//! Core domain types and logic.

pub mod aggregator;
pub mod bar;
pub mod bar_history;
pub mod config_validation;
pub mod error;
pub mod execution;
pub mod ledger;
pub mod packet;
pub mod position;
pub mod replay;
pub mod resolution;
pub mod run;
pub mod session;
pub mod strategies;
pub mod strategy;
pub mod streaming;
