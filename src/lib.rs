pub mod azure;
pub mod comms;
pub mod config;
pub mod startup;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
