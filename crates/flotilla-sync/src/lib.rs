//! The flotilla sync engine.
//!
//! Moving a tree is four cooperating pieces:
//!
//! - [`walk`]: enumerate one side, breadth-first or via the backend's
//!   recursive fast path, filtered as it goes
//! - [`diff`]: merge the two listings into per-name transfer decisions
//! - [`transfer`]: the per-object pipeline (open → hash tee → upload →
//!   verify → set mtime) with server-side accelerations
//! - [`sync`]: the bounded worker pool draining decisions with
//!   per-destination ordering, delete phases and outcome aggregation
//!
//! Large objects go through [`chunker`], which sizes parts to the backend's
//! manifest limits and bounds outstanding parts with a token dispenser.

pub mod chunker;
pub mod diff;
pub mod sync;
pub mod transfer;
pub mod walk;

pub use diff::{Action, Decision, DiffOpts};
pub use flotilla_pacer::PacerConfig;
pub use sync::{copy_dirs, move_dirs, sync, DeleteMode, SyncOpts, SyncOutcome};
pub use transfer::{Transfer, TransferOpts, TransferState};
pub use walk::{walk, WalkOpts};
