//! Evaluation VMs (spec §4.6): three small sequential interpreters sharing
//! an [`EvalContext`] of role-bound tuple buffers. Grounded on
//! `original_source/dsms/.../internals/{aeval,beval,heval,eval_context}.{h,cc}`,
//! reshaped around byte-offset addressing (see `crate::tuple`'s
//! `read_int`/`write_int`/... helpers) rather than the reference's
//! `ILOC`/`FLOC`/`CLOC`/`BLOC` word-addressing macros.

mod aeval;
mod beval;
mod context;
mod heval;

pub use aeval::{AEval, AInstr, AOp};
pub use beval::{BEval, BInstr, BOp};
pub use context::EvalContext;
pub use heval::{HEval, HInstr};

/// Named role slots (spec §4.6). An operator binds the roles it needs before
/// invoking an evaluator; unused roles are simply never bound.
pub mod role {
    pub const INPUT: usize = 0;
    pub const OUTER: usize = 1;
    pub const INNER: usize = 2;
    pub const OUTPUT: usize = 3;
    pub const SYN: usize = 4;
    pub const CONST: usize = 5;
    pub const SCRATCH: usize = 6;
    pub const UPDATE: usize = 7;
    pub const SCAN: usize = 8;
    /// A candidate tuple fetched from a store during a hash-index scan, bound
    /// opposite `SCAN` for the `key_equal` comparison (spec §4.4).
    pub const KEY: usize = 9;
}
