use serde::{Deserialize, Serialize};

use super::EvalContext;
use crate::error::{EngineError, Result};
use crate::tuple::{read_byte, read_char, read_float, read_int, write_byte, write_char, write_float, write_int};

/// Arithmetic opcodes (spec §4.6). `IntMax`/`IntMin`/`FltMax`/`FltMin` are
/// the reference's `INT_UMX`/`INT_UMN`/`FLT_UMX`/`FLT_UMN` ("update max" /
/// "update min"): `dest = max(r1, r2)` / `dest = min(r1, r2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AOp {
    IntAdd,
    IntSub,
    IntMul,
    IntDiv,
    FltAdd,
    FltSub,
    FltMul,
    FltDiv,
    IntCopy,
    FltCopy,
    ChrCopy,
    BytCopy,
    IntMax,
    IntMin,
    FltMax,
    FltMin,
    /// `dest = (float) r1 / (int) r2` — sum-then-divide-by-count average
    /// from an integer running sum.
    IntAvg,
    /// `dest = r1 / (float) r2` — average from a float running sum.
    FltAvg,
}

/// One arithmetic instruction: `(op, r1, c1, r2, c2, dest_r, dest_c)` (spec
/// §4.6). `len` is only consulted by `ChrCopy`, where it is the fixed
/// `CHAR(n)` width being copied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AInstr {
    pub op: AOp,
    pub r1: usize,
    pub c1: usize,
    pub r2: usize,
    pub c2: usize,
    pub dr: usize,
    pub dc: usize,
    pub len: usize,
}

impl AInstr {
    /// Convenience constructor for the common unary ops (`*Copy`) where `r2`
    /// and `c2` are unused.
    pub fn unary(op: AOp, r1: usize, c1: usize, dr: usize, dc: usize, len: usize) -> Self {
        Self { op, r1, c1, r2: 0, c2: 0, dr, dc, len }
    }

    pub fn binary(op: AOp, r1: usize, c1: usize, r2: usize, c2: usize, dr: usize, dc: usize) -> Self {
        Self { op, r1, c1, r2, c2, dr, dc, len: 0 }
    }
}

/// A sequence of up to 20 typed arithmetic instructions (spec §4.6),
/// executed in order against a shared [`EvalContext`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AEval {
    instrs: Vec<AInstr>,
}

impl AEval {
    pub const MAX_INSTRS: usize = 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: AInstr) -> Result<()> {
        if self.instrs.len() >= Self::MAX_INSTRS {
            return Err(EngineError::PlanViolation(format!(
                "AEval program exceeds {} instructions",
                Self::MAX_INSTRS
            )));
        }
        self.instrs.push(instr);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn eval(&self, ctx: &mut EvalContext) {
        for instr in &self.instrs {
            match instr.op {
                AOp::IntAdd => {
                    let v = read_int(ctx.role(instr.r1), instr.c1) + read_int(ctx.role(instr.r2), instr.c2);
                    write_int(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::IntSub => {
                    let v = read_int(ctx.role(instr.r1), instr.c1) - read_int(ctx.role(instr.r2), instr.c2);
                    write_int(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::IntMul => {
                    let v = read_int(ctx.role(instr.r1), instr.c1) * read_int(ctx.role(instr.r2), instr.c2);
                    write_int(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::IntDiv => {
                    let v = read_int(ctx.role(instr.r1), instr.c1) / read_int(ctx.role(instr.r2), instr.c2);
                    write_int(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::FltAdd => {
                    let v = read_float(ctx.role(instr.r1), instr.c1) + read_float(ctx.role(instr.r2), instr.c2);
                    write_float(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::FltSub => {
                    let v = read_float(ctx.role(instr.r1), instr.c1) - read_float(ctx.role(instr.r2), instr.c2);
                    write_float(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::FltMul => {
                    let v = read_float(ctx.role(instr.r1), instr.c1) * read_float(ctx.role(instr.r2), instr.c2);
                    write_float(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::FltDiv => {
                    let v = read_float(ctx.role(instr.r1), instr.c1) / read_float(ctx.role(instr.r2), instr.c2);
                    write_float(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::IntCopy => {
                    let v = read_int(ctx.role(instr.r1), instr.c1);
                    write_int(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::FltCopy => {
                    let v = read_float(ctx.role(instr.r1), instr.c1);
                    write_float(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::BytCopy => {
                    let v = read_byte(ctx.role(instr.r1), instr.c1);
                    write_byte(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::ChrCopy => {
                    let v = read_char(ctx.role(instr.r1), instr.c1, instr.len).to_vec();
                    write_char(ctx.role_mut(instr.dr), instr.dc, instr.len, &v);
                }
                AOp::IntMax => {
                    let v = read_int(ctx.role(instr.r1), instr.c1).max(read_int(ctx.role(instr.r2), instr.c2));
                    write_int(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::IntMin => {
                    let v = read_int(ctx.role(instr.r1), instr.c1).min(read_int(ctx.role(instr.r2), instr.c2));
                    write_int(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::FltMax => {
                    let v = read_float(ctx.role(instr.r1), instr.c1).max(read_float(ctx.role(instr.r2), instr.c2));
                    write_float(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::FltMin => {
                    let v = read_float(ctx.role(instr.r1), instr.c1).min(read_float(ctx.role(instr.r2), instr.c2));
                    write_float(ctx.role_mut(instr.dr), instr.dc, v);
                }
                AOp::IntAvg => {
                    let sum = read_int(ctx.role(instr.r1), instr.c1) as f32;
                    let count = read_int(ctx.role(instr.r2), instr.c2) as f32;
                    write_float(ctx.role_mut(instr.dr), instr.dc, sum / count);
                }
                AOp::FltAvg => {
                    let sum = read_float(ctx.role(instr.r1), instr.c1);
                    let count = read_int(ctx.role(instr.r2), instr.c2) as f32;
                    write_float(ctx.role_mut(instr.dr), instr.dc, sum / count);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::role;

    #[test]
    fn int_add_writes_destination_role() {
        let mut ctx = EvalContext::new();
        ctx.bind(role::OUTER, 10i32.to_le_bytes().to_vec());
        ctx.bind(role::INNER, 20i32.to_le_bytes().to_vec());
        ctx.bind(role::OUTPUT, vec![0u8; 4]);

        let mut eval = AEval::new();
        eval.push(AInstr::binary(AOp::IntAdd, role::OUTER, 0, role::INNER, 0, role::OUTPUT, 0)).unwrap();
        eval.eval(&mut ctx);

        assert_eq!(read_int(ctx.role(role::OUTPUT), 0), 30);
    }

    #[test]
    fn avg_divides_sum_by_count_as_float() {
        let mut ctx = EvalContext::new();
        ctx.bind(role::SYN, 30i32.to_le_bytes().to_vec());
        let mut count = 2i32.to_le_bytes().to_vec();
        count.extend(4i32.to_le_bytes());
        ctx.bind(role::SCRATCH, count);
        ctx.bind(role::OUTPUT, vec![0u8; 4]);

        let mut eval = AEval::new();
        eval.push(AInstr::binary(AOp::IntAvg, role::SYN, 0, role::SCRATCH, 0, role::OUTPUT, 0)).unwrap();
        eval.eval(&mut ctx);

        assert_eq!(read_float(ctx.role(role::OUTPUT), 0), 15.0);
    }

    #[test]
    fn program_length_is_capped() {
        let mut eval = AEval::new();
        for _ in 0..AEval::MAX_INSTRS {
            eval.push(AInstr::unary(AOp::IntCopy, 0, 0, 0, 0, 0)).unwrap();
        }
        assert!(eval.push(AInstr::unary(AOp::IntCopy, 0, 0, 0, 0, 0)).is_err());
    }
}
