#![forbid(unsafe_code)]

//! Download job lifecycle for the simplyt backend: metadata extraction, format
//! selection, external downloader supervision, progress polling and artifact
//! hand-off.

pub mod config;
pub mod controller;
pub mod error;
pub mod jobs;
pub mod metadata;
pub mod progress;
pub mod runner;
pub mod security;
