#![forbid(unsafe_code)]

//! Shared building blocks for the nasvid binaries: configuration, the on-disk
//! catalog, the fetch pipeline and the job queue that drives it.

pub mod config;
pub mod identifier;
pub mod jobs;
pub mod library;
pub mod logging;
pub mod nfo;
pub mod pipeline;
pub mod playlist;
pub mod scraper;
