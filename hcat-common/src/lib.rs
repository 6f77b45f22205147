//! # hcat Common Library
//!
//! Shared code for the hcat catalog services including:
//! - Common error and result types
//! - Configuration loading and root folder resolution
//! - SQLite pool setup
//! - Ingest event types and the broadcast EventBus

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
