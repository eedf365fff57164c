pub mod azure;
pub mod config;
pub mod diagnostics;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod security;
pub mod server;
pub mod transport;
