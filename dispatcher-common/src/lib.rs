//! Dispatcher Common Library
//!
//! Shared wire model, configuration loader and error vocabulary for the
//! dispatcher workspace: the typed records every other crate builds on, so
//! nothing downstream operates on bare `serde_json::Value` documents.
//!
//! # Module Structure
//!
//! - [`types`] - Core DAQ data model (status, node rows, goals, commands)
//! - [`config`] - Startup configuration loading
//! - [`error`] - Closed error vocabulary shared by the core and store crates
//! - [`clock`] - Injectable wall-clock abstraction
//! - [`prelude`] - Common re-exports for convenience

pub mod clock;
pub mod config;
pub mod error;
pub mod prelude;
pub mod types;
