//! # History
//!
//! Immutable audit trail of every process, node and task transition.
//! Records are written through [`HistoryRecorder`], which stamps them with a
//! per-process monotonic timestamp and sequence and keeps audit outages from
//! blocking orchestration.

pub mod recorder;

pub use crate::models::{HistoryAction, HistoryRecord};
pub use recorder::{HistoryRecorder, HistoryStats};
