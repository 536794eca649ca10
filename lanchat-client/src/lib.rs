mod config;
mod connection;
mod error;
mod event;
pub mod storage;

pub use config::ClientConfig;
pub use connection::{ClientHandle, connect, run, spawn};
pub use error::TransportError;
pub use event::{ClientCommand, ClientEvent};
