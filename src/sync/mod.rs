//! Dependency-ordered synchronization.
//!
//! # Data Flow
//! ```text
//! job.rs (descriptors → topological order)
//!     → orchestrator.rs
//!         → source.rs     fetch / fetch_changed
//!         → transform.rs  field_map, relation keys → remote ids
//!         → client/       find_or_create (or dry-run preview)
//!         → result.rs     BatchResult per job, SyncReport, RunState on disk
//! ```

pub mod job;
pub mod orchestrator;
pub mod result;
pub mod source;
pub mod transform;

pub use job::{topological_order, SyncJobDescriptor};
pub use orchestrator::{SyncOptions, SyncOrchestrator};
pub use result::{BatchResult, RecordError, RecordOutcome, RecordStatus, RunState, SyncReport};
pub use source::{source_from_config, EmptySource, JsonDirSource, RecordSource, StaticSource};
pub use transform::{KeyIndex, TransformedRecord};
