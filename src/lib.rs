pub mod auth;
#[cfg(feature = "executable-deps")]
pub mod cli;
pub mod config;
pub mod document;
pub mod logging;
pub mod ot;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod store;
pub mod types;
