//! Update manager configuration.

mod loader;
mod paths;
mod types;

pub use types::{AppConfig, ClientConfig, Config};
