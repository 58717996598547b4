//! Core of the media proxy: access control, the on-disk content cache, acquisition of content
//! through an external downloader and the coordination that ties them together.

#[macro_use]
pub mod metrics;

pub mod access;
pub mod acquire;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identifier;
pub mod inflight;
pub mod logging;
pub mod store;
pub mod utils;
