//! Data models for hcat-ingest
//!
//! - session: ingest session state machine and configuration
//! - mapping / finding / job / manifest: artifacts each pipeline step produces
//! - schema: built-in target schemas per descriptive standard
//! - profile: saved mapping profiles reused across sessions

pub mod finding;
pub mod job;
pub mod manifest;
pub mod mapping;
pub mod profile;
pub mod row;
pub mod schema;
pub mod session;

pub use finding::{FindingSummary, Severity, ValidationFinding};
pub use job::{CommitStage, IngestJob, JobErrorEntry, JobStatus, RowCommitError};
pub use manifest::{
    ManifestAction, ManifestAsset, ManifestDocument, ManifestEntry, ManifestEntryState,
};
pub use mapping::{FieldMapping, MappingCandidate, MappingOverride, MappingStatus, Transform};
pub use profile::MappingProfile;
pub use row::{MappedRow, SourceRow};
pub use schema::{FieldKind, TargetField, TargetSchema};
pub use session::{
    HierarchyMode, IngestSession, SessionConfig, SessionState, SourceDescriptor, StateTransition,
};
