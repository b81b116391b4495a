//! reelfetch library crate.
//!
//! Download and materialization pipeline of the media-acquisition agent.

pub mod admission;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod downloader;
pub mod error;
pub mod library;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod provider;
pub mod utils;

pub use error::{Error, Result};
