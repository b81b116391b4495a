//! Admission layer: deduplication, on-disk checks and provider throttling.

mod rate_limiter;
mod runner;

pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use runner::{AdmissionReport, AdmissionRunner};
