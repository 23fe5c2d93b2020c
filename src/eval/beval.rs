use serde::{Deserialize, Serialize};

use super::{AEval, EvalContext};
use crate::error::{EngineError, Result};
use crate::tuple::{read_byte, read_char, read_float, read_int};

/// Boolean comparators (spec §4.6), one per `{<, ≤, >, ≥, =, ≠}` crossed with
/// `{Int, Float, Char, Byte}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BOp {
    IntLt,
    IntLe,
    IntGt,
    IntGe,
    IntEq,
    IntNe,
    FltLt,
    FltLe,
    FltGt,
    FltGe,
    FltEq,
    FltNe,
    ChrLt,
    ChrLe,
    ChrGt,
    ChrGe,
    ChrEq,
    ChrNe,
    BytLt,
    BytLe,
    BytGt,
    BytGe,
    BytEq,
    BytNe,
}

/// One comparator instruction, optionally preceded by materialising one or
/// both operands via an [`AEval`] (spec §4.6: "optionally preceded by
/// invoking an `AEval` to materialise a computed operand"). `len` is the
/// `CHAR(n)` width for `Chr*` comparators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BInstr {
    pub op: Option<BOp>,
    pub r1: usize,
    pub c1: usize,
    pub r2: usize,
    pub c2: usize,
    pub len: usize,
    pub pre1: Option<AEval>,
    pub pre2: Option<AEval>,
}

impl BInstr {
    pub fn cmp(op: BOp, r1: usize, c1: usize, r2: usize, c2: usize) -> Self {
        Self { op: Some(op), r1, c1, r2, c2, len: 0, pre1: None, pre2: None }
    }

    pub fn chr_cmp(op: BOp, r1: usize, c1: usize, r2: usize, c2: usize, len: usize) -> Self {
        Self { op: Some(op), r1, c1, r2, c2, len, pre1: None, pre2: None }
    }
}

/// A conjunctive sequence of up to 20 comparators (spec §4.6): the overall
/// predicate is the logical AND of every instruction, short-circuiting to
/// `false` on the first failing comparator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BEval {
    instrs: Vec<BInstr>,
}

impl BEval {
    pub const MAX_INSTRS: usize = 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: BInstr) -> Result<()> {
        if self.instrs.len() >= Self::MAX_INSTRS {
            return Err(EngineError::PlanViolation(format!(
                "BEval program exceeds {} instructions",
                Self::MAX_INSTRS
            )));
        }
        self.instrs.push(instr);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn eval(&self, ctx: &mut EvalContext) -> bool {
        for instr in &self.instrs {
            if let Some(pre) = &instr.pre1 {
                pre.eval(ctx);
            }
            if let Some(pre) = &instr.pre2 {
                pre.eval(ctx);
            }
            let Some(op) = instr.op else { continue };
            let ok = match op {
                BOp::IntLt => read_int(ctx.role(instr.r1), instr.c1) < read_int(ctx.role(instr.r2), instr.c2),
                BOp::IntLe => read_int(ctx.role(instr.r1), instr.c1) <= read_int(ctx.role(instr.r2), instr.c2),
                BOp::IntGt => read_int(ctx.role(instr.r1), instr.c1) > read_int(ctx.role(instr.r2), instr.c2),
                BOp::IntGe => read_int(ctx.role(instr.r1), instr.c1) >= read_int(ctx.role(instr.r2), instr.c2),
                BOp::IntEq => read_int(ctx.role(instr.r1), instr.c1) == read_int(ctx.role(instr.r2), instr.c2),
                BOp::IntNe => read_int(ctx.role(instr.r1), instr.c1) != read_int(ctx.role(instr.r2), instr.c2),
                BOp::FltLt => read_float(ctx.role(instr.r1), instr.c1) < read_float(ctx.role(instr.r2), instr.c2),
                BOp::FltLe => read_float(ctx.role(instr.r1), instr.c1) <= read_float(ctx.role(instr.r2), instr.c2),
                BOp::FltGt => read_float(ctx.role(instr.r1), instr.c1) > read_float(ctx.role(instr.r2), instr.c2),
                BOp::FltGe => read_float(ctx.role(instr.r1), instr.c1) >= read_float(ctx.role(instr.r2), instr.c2),
                BOp::FltEq => read_float(ctx.role(instr.r1), instr.c1) == read_float(ctx.role(instr.r2), instr.c2),
                BOp::FltNe => read_float(ctx.role(instr.r1), instr.c1) != read_float(ctx.role(instr.r2), instr.c2),
                BOp::BytLt => read_byte(ctx.role(instr.r1), instr.c1) < read_byte(ctx.role(instr.r2), instr.c2),
                BOp::BytLe => read_byte(ctx.role(instr.r1), instr.c1) <= read_byte(ctx.role(instr.r2), instr.c2),
                BOp::BytGt => read_byte(ctx.role(instr.r1), instr.c1) > read_byte(ctx.role(instr.r2), instr.c2),
                BOp::BytGe => read_byte(ctx.role(instr.r1), instr.c1) >= read_byte(ctx.role(instr.r2), instr.c2),
                BOp::BytEq => read_byte(ctx.role(instr.r1), instr.c1) == read_byte(ctx.role(instr.r2), instr.c2),
                BOp::BytNe => read_byte(ctx.role(instr.r1), instr.c1) != read_byte(ctx.role(instr.r2), instr.c2),
                // Fixed-width CHAR columns are null-padded; comparing the
                // padded bytes directly gives the same ordering as the
                // reference's `strcmp` on these columns (see DESIGN.md).
                BOp::ChrLt => read_char(ctx.role(instr.r1), instr.c1, instr.len) < read_char(ctx.role(instr.r2), instr.c2, instr.len),
                BOp::ChrLe => read_char(ctx.role(instr.r1), instr.c1, instr.len) <= read_char(ctx.role(instr.r2), instr.c2, instr.len),
                BOp::ChrGt => read_char(ctx.role(instr.r1), instr.c1, instr.len) > read_char(ctx.role(instr.r2), instr.c2, instr.len),
                BOp::ChrGe => read_char(ctx.role(instr.r1), instr.c1, instr.len) >= read_char(ctx.role(instr.r2), instr.c2, instr.len),
                BOp::ChrEq => read_char(ctx.role(instr.r1), instr.c1, instr.len) == read_char(ctx.role(instr.r2), instr.c2, instr.len),
                BOp::ChrNe => read_char(ctx.role(instr.r1), instr.c1, instr.len) != read_char(ctx.role(instr.r2), instr.c2, instr.len),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::role;

    #[test]
    fn conjunctive_short_circuits_on_first_failure() {
        let mut ctx = EvalContext::new();
        ctx.bind(role::INPUT, 5i32.to_le_bytes().to_vec());
        ctx.bind(role::CONST, 10i32.to_le_bytes().to_vec());

        let mut eval = BEval::new();
        eval.push(BInstr::cmp(BOp::IntGt, role::INPUT, 0, role::CONST, 0)).unwrap();
        assert!(!eval.eval(&mut ctx));
    }

    #[test]
    fn empty_program_is_vacuously_true() {
        let mut ctx = EvalContext::new();
        assert!(BEval::new().eval(&mut ctx));
    }

    #[test]
    fn char_comparison_respects_null_padding() {
        let mut ctx = EvalContext::new();
        ctx.bind(role::INPUT, b"ab\0\0".to_vec());
        ctx.bind(role::CONST, b"ab\0\0".to_vec());
        let mut eval = BEval::new();
        eval.push(BInstr::chr_cmp(BOp::ChrEq, role::INPUT, 0, role::CONST, 0, 4)).unwrap();
        assert!(eval.eval(&mut ctx));
    }
}
