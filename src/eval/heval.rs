use serde::{Deserialize, Serialize};

use super::EvalContext;
use crate::error::{EngineError, Result};
use crate::tuple::{read_byte, read_char, read_int, AttrType};

/// One column's contribution to a hash (spec §4.6). `role`/`col` address the
/// bound tuple the same way `AInstr`/`BInstr` do; `ty` determines how the
/// bytes at that offset are interpreted. `AttrType::Float` is rejected at
/// construction time (spec §9: "the reference intentionally excludes floats
/// from hash keys").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HInstr {
    pub ty: AttrType,
    pub role: usize,
    pub col: usize,
}

/// Folds up to 20 per-column hash contributions into a single 32-bit hash
/// using djb2 multiplication (spec §4.4, §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HEval {
    instrs: Vec<HInstr>,
}

impl HEval {
    pub const MAX_INSTRS: usize = 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: HInstr) -> Result<()> {
        if matches!(instr.ty, AttrType::Float) {
            return Err(EngineError::PlanViolation(
                "HEval cannot hash a FLOAT column (spec §9)".into(),
            ));
        }
        if self.instrs.len() >= Self::MAX_INSTRS {
            return Err(EngineError::PlanViolation(format!(
                "HEval program exceeds {} instructions",
                Self::MAX_INSTRS
            )));
        }
        self.instrs.push(instr);
        Ok(())
    }

    pub fn eval(&self, ctx: &EvalContext) -> u32 {
        let mut hash: u32 = 5381;
        for instr in &self.instrs {
            match instr.ty {
                AttrType::Int => {
                    let v = int_mix(read_int(ctx.role(instr.role), instr.col));
                    hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(v as u32);
                }
                AttrType::Byte => {
                    let v = read_byte(ctx.role(instr.role), instr.col);
                    hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(v as u32);
                }
                AttrType::Char(n) => {
                    for &b in read_char(ctx.role(instr.role), instr.col, n as usize) {
                        if b == 0 {
                            break;
                        }
                        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(b as u32);
                    }
                }
                AttrType::Float => unreachable!("rejected in HEval::push"),
            }
        }
        hash
    }
}

/// Thomas Wang's integer mixer (spec §4.4's "deterministic reversible mixer
/// on integers"), bit-for-bit as in `original_source/.../internals/heval.h`.
fn int_mix(key: i32) -> i32 {
    let mut key = key;
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::role;

    #[test]
    fn hash_is_deterministic_for_same_key() {
        let mut ctx = EvalContext::new();
        ctx.bind(role::INPUT, 42i32.to_le_bytes().to_vec());
        let mut eval = HEval::new();
        eval.push(HInstr { ty: AttrType::Int, role: role::INPUT, col: 0 }).unwrap();
        assert_eq!(eval.eval(&ctx), eval.eval(&ctx));
    }

    #[test]
    fn float_column_is_rejected_at_construction() {
        let mut eval = HEval::new();
        let err = eval.push(HInstr { ty: AttrType::Float, role: role::INPUT, col: 0 });
        assert!(err.is_err());
    }

    #[test]
    fn char_hash_stops_at_null_terminator() {
        let mut ctx1 = EvalContext::new();
        ctx1.bind(role::INPUT, b"ab\0\0".to_vec());
        let mut ctx2 = EvalContext::new();
        ctx2.bind(role::INPUT, b"ab\0X".to_vec());

        let mut eval = HEval::new();
        eval.push(HInstr { ty: AttrType::Char(4), role: role::INPUT, col: 0 }).unwrap();
        assert_eq!(eval.eval(&ctx1), eval.eval(&ctx2));
    }
}
