#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod client;
pub mod config;
pub mod manager;
pub mod passthrough;
pub mod report;
pub mod task;
