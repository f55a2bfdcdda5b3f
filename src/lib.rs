//! Library crate for tls-h2-scan-rs exposing reusable modules.
pub mod config;
pub mod geo;
pub mod ipstep;
pub mod output;
pub mod probe;
pub mod scanner;
pub mod targets;
pub mod types;
