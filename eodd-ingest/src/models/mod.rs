//! Data models for eodd-ingest
//!
//! - Scene lifecycle state machine
//! - Persisted scene records and catalog candidates
//! - Footprint bounding boxes and catalog filters

pub mod scene;

pub use scene::{BoundingBox, CandidateProduct, LocalArtifact, SceneQuery, SceneRecord, SceneState};
