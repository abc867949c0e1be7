#![doc = include_str!("../../../README.md")]

/// The version of this crate, as read from Cargo.toml at build time
pub const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line interface, subcommands, and output rendering
pub mod cli;
/// Cluster inspection through the Kubernetes API
pub mod cluster;
/// Layered configuration for the CLI
pub mod config;
/// The conversion pipeline tying every step together
pub mod convert;
/// Error types for the whole crate
pub mod error;
/// Initdata document construction and the workload annotation
pub mod initdata;
/// Staging and uploading resources to the key broker service
pub mod kbs;
/// Driving the kubectl binary for uploads and applies
pub mod kubectl;
/// Schemaless manifest loading, navigation, and rendering
pub mod manifest;
/// Secret reference discovery and sealed-secret construction
pub mod secrets;
/// Secure-access sidecar and companion Service injection
pub mod sidecar;
/// Certificate authority and leaf certificate handling
pub mod tls;
