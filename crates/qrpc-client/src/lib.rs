//! RPC caller: publishes requests to a task queue and correlates replies
//! from a private reply queue. See [`RpcClient`].

pub mod client;
pub mod pending;

pub use client::{ClientConfig, RpcClient};
pub use pending::PendingCallMap;
