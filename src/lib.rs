#![cfg(target_family = "unix")]

pub mod audit;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod readiness;
pub mod sender;
pub mod transport;
