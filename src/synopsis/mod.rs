//! Synopses (spec §4.5): logical bag views over a `(store, stub_id)` pair,
//! each with zero or more attached [`crate::index::HashIndex`]es and
//! pre-declared scans. Four shapes mirror the four non-simple store shapes.

mod lineage;
mod partition_window;
mod relation;
mod window;

pub use lineage::LineageSynopsis;
pub use partition_window::PartitionWindowSynopsis;
pub use relation::RelationSynopsis;
pub use window::WindowSynopsis;

use crate::eval::BEval;

/// One pre-declared scan: an optional index to probe and an optional
/// residual boolean predicate applied after the index (or full-store) scan
/// (spec §4.5). Identified by its position in the synopsis's scan list — an
/// "opaque scan id" per spec §3.
#[derive(Default)]
pub struct ScanSpec {
    pub index: Option<usize>,
    pub residual: Option<BEval>,
}

impl ScanSpec {
    pub fn full_scan() -> Self {
        Self { index: None, residual: None }
    }

    pub fn indexed(index: usize) -> Self {
        Self { index: Some(index), residual: None }
    }

    pub fn with_residual(mut self, residual: BEval) -> Self {
        self.residual = Some(residual);
        self
    }
}
