//! Host-side driver for the mixed-phase attention engine: configuration
//! loading, logging setup and synthetic scenarios.

pub mod config;
pub mod logging;
pub mod scenario;
