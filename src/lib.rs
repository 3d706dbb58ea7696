//! Oracle Sidecar Library
//!
//! Market-data oracle side-car: polls and streams exchange quotes, converts
//! them through configured paths and publishes one median price per pair.

pub mod config;
pub mod marketmap;
pub mod oracle;
pub mod orchestrator;
pub mod providers;
pub mod shutdown;
pub mod types;
