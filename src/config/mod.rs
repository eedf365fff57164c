pub mod env;
pub mod loader;
pub mod types;
