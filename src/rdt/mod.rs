// rdt/mod.rs

pub mod client;
pub mod common;
pub mod config;
pub mod congestion;
pub mod dispatcher;
pub mod link;
pub mod metrics;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_util;

pub use client::Client;
pub use common::{Algorithm, RoomCode, TransferError, TransferReport};
pub use config::TransferConfig;
pub use dispatcher::Server;
