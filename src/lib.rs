// RustyPlane - per-node network policy dataplane agent
// Core library module

pub mod common;
pub mod driver;
pub mod environment;
pub mod error;
pub mod fastpath;
pub mod ifacemon;
pub mod ipsets;
pub mod managers;
pub mod maps;
pub mod marks;
pub mod proto;
pub mod render;
pub mod routes;
pub mod tables;

pub use common::AgentConfig;
pub use error::{DpError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
