//! Fetch pipeline for the blotter ingestion system.
//!
//! Ties together the per-state circuit breaker, the API key rotation pool,
//! the rate-limited HTTP client, defensive payload parsing, the producer
//! that enumerates work, and the worker loop (plus its heavy-lift profile)
//! that drains the delivery queue.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod error;
pub mod keypool;
pub mod ops;
pub mod parse;
pub mod pool;
pub mod producer;
pub mod storage;
pub mod target;
pub mod worker;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use client::{ClientConfig, ClientStats, FetchClient};
pub use error::{FetchError, Result};
pub use keypool::{KeyPool, KeyStats};
pub use ops::OpsSnapshot;
pub use pool::WorkerPool;
pub use producer::{EnqueueOutcome, Producer};
pub use storage::{FetchStorage, PostgresFetchStorage};
pub use target::FetchTarget;
pub use worker::{FetchWorker, WorkerConfig};
