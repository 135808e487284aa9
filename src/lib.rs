pub mod auth;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod peer;
pub mod rooms;
pub mod rpc;
pub mod server;
pub mod session;
pub mod track;
pub mod util;

pub use config::Config;
pub use server::Server;
