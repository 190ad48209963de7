pub mod error;
pub mod local_api;
