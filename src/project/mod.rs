//! # Project — Types, Lifecycle and Per-Type Strategies
//!
//! A project is created from a draft, partitioned into groups of tasks, and
//! then tracked through counters updated by the synchronization job.
//!
//! ```text
//! projectDrafts/{id}  (live store)
//!     ↓ ProjectDraft::from_value
//! ProjectType::strategy() → validate_geometry → create_groups → create_tasks
//!     ↓ lifecycle::on_project_created
//! PartitionedProject  → create::ProjectCreator writes both stores
//! ```
//!
//! ## Module Structure
//!
//! - [`types`] — Project/Group/Task and their enums
//! - [`lifecycle`] — pure counter transitions and invariant checks
//! - [`strategy`] — the `ProjectStrategy` trait and one impl per type family
//! - [`draft`] — draft documents and their defaults

mod draft;
pub mod lifecycle;
mod strategy;
mod types;

pub use draft::*;
pub use strategy::*;
pub use types::*;
