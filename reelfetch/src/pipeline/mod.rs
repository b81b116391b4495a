//! Bounded-concurrency job execution.

mod job;
mod worker_pool;

pub use job::{Job, JobContext};
pub use worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};
