//! Worker side of the RPC bridge: a scalable pool of queue consumers that
//! execute tasks against a backend and publish the replies.
//!
//! - [`executor::WorkExecutor`] is the seam to the actual workload; the
//!   stock [`executor::HttpExecutor`] fetches the task path from an HTTP
//!   backend.
//! - [`consumer::Consumer`] serves one queue on one channel with
//!   prefetch 1.
//! - [`pool::ConsumerPool`] keeps the running consumers reconciled against
//!   the desired concurrency.

pub mod consumer;
pub mod executor;
pub mod pool;

pub use consumer::{Consumer, ConsumerHandle};
pub use executor::{ExecError, HttpExecutor, WorkExecutor};
pub use pool::{ConsumerPool, PoolConfig, MAX_CONSUMERS};
