//! Test Helper Utilities
//!
//! Shared utilities for testing eodd-ingest

#![allow(dead_code)]

pub mod fake_sensor;
pub mod store_utils;

pub use fake_sensor::{minimal_zip, FakeDownload, FakeSensor};
pub use store_utils::{candidate, create_test_store, settings, ts};
