//! barsim: multi-resolution bar aggregation, replay and paper trading.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`]. The [`cli`] module wires them
//! together for the `barsim` binary.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod ports;
