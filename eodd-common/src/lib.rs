//! # EODD Common Library
//!
//! Shared code for the EODD ingestion workspace including:
//! - Common error and result types
//! - Root folder and TOML configuration resolution
//! - Configuration signature files
//! - SQLite pool initialization, schema creation and migrations
//! - Timestamp helpers for the persisted RFC 3339 format

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
