//! Machine-independent optimization on SSA form.
//!
//! Four passes run interleaved to a fixed point: constant folding (with
//! algebraic simplification), copy/constant propagation, branch
//! simplification, and dead code elimination. All of them rely on the SSA
//! property that a vreg has exactly one definition; the driver wraps them
//! between `make_ssa` and `resolve_phis`.

use std::collections::HashMap;

use chert_entity::EntitySet;
use log::trace;

use crate::ir::{
    BinaryOp, BlockContainer, CondCode, CondKind, Inst, IrFlags, UnaryOp, VReg, VRegFlags,
    VRegSize,
};
use crate::regalloc::RegAlloc;
use crate::ssa::{make_ssa, resolve_phis};

/// Run the whole optimization pipeline: SSA construction, the fixed-point
/// pass loop, and φ-resolution back to non-SSA form.
pub fn optimize(ra: &mut RegAlloc, bbcon: &mut BlockContainer) {
    make_ssa(ra, bbcon);
    let mut rounds = 0;
    loop {
        let mut changed = false;
        changed |= fold_constants(ra, bbcon);
        changed |= propagate_copies(ra, bbcon);
        changed |= simplify_branches(bbcon, ra);
        changed |= eliminate_dead_code(ra, bbcon);
        rounds += 1;
        if !changed {
            break;
        }
    }
    trace!("optimizer converged after {} rounds", rounds);
    resolve_phis(ra, bbcon);
}

/// Truncate a folded value to the destination size, re-extending by
/// signedness so constants stay canonical 64-bit values.
fn normalize(value: i64, size: VRegSize, unsigned: bool) -> i64 {
    match (size, unsigned) {
        (VRegSize::B8, false) => value as i8 as i64,
        (VRegSize::B8, true) => value as u8 as i64,
        (VRegSize::B16, false) => value as i16 as i64,
        (VRegSize::B16, true) => value as u16 as i64,
        (VRegSize::B32, false) => value as i32 as i64,
        (VRegSize::B32, true) => value as u32 as i64,
        (VRegSize::B64, _) => value,
    }
}

fn eval_binary(op: BinaryOp, lhs: i64, rhs: i64, unsigned: bool) -> Option<i64> {
    Some(match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::Div if rhs == 0 => return None,
        BinaryOp::Div if unsigned => ((lhs as u64) / (rhs as u64)) as i64,
        BinaryOp::Div => lhs.wrapping_div(rhs),
        BinaryOp::Mod if rhs == 0 => return None,
        BinaryOp::Mod if unsigned => ((lhs as u64) % (rhs as u64)) as i64,
        BinaryOp::Mod => lhs.wrapping_rem(rhs),
        BinaryOp::BitAnd => lhs & rhs,
        BinaryOp::BitOr => lhs | rhs,
        BinaryOp::BitXor => lhs ^ rhs,
        BinaryOp::LShift => lhs.wrapping_shl(rhs as u32 & 63),
        BinaryOp::RShift if unsigned => ((lhs as u64) >> (rhs as u32 & 63)) as i64,
        BinaryOp::RShift => lhs.wrapping_shr(rhs as u32 & 63),
    })
}

fn eval_compare(cc: CondCode, lhs: i64, rhs: i64) -> bool {
    if cc.unsigned {
        let (l, r) = (lhs as u64, rhs as u64);
        match cc.kind {
            CondKind::Eq => l == r,
            CondKind::Ne => l != r,
            CondKind::Lt => l < r,
            CondKind::Le => l <= r,
            CondKind::Ge => l >= r,
            CondKind::Gt => l > r,
            CondKind::Any => true,
            CondKind::None => false,
        }
    } else {
        match cc.kind {
            CondKind::Eq => lhs == rhs,
            CondKind::Ne => lhs != rhs,
            CondKind::Lt => lhs < rhs,
            CondKind::Le => lhs <= rhs,
            CondKind::Ge => lhs >= rhs,
            CondKind::Gt => lhs > rhs,
            CondKind::Any => true,
            CondKind::None => false,
        }
    }
}

/// Fold arithmetic on constants and apply algebraic identities.
fn fold_constants(ra: &mut RegAlloc, bbcon: &mut BlockContainer) -> bool {
    let mut changed = false;
    let order = bbcon.order.clone();
    for &bb in &order {
        for idx in 0..bbcon.blocks[bb].insts.len() {
            let replacement = match &bbcon.blocks[bb].insts[idx] {
                Inst::Binary {
                    op,
                    dst,
                    lhs,
                    rhs,
                    flags,
                } => {
                    let (op, dst, lhs, rhs) = (*op, *dst, *lhs, *rhs);
                    let unsigned = flags.contains(IrFlags::UNSIGNED);
                    let ldata = &ra.vregs[lhs];
                    let rdata = &ra.vregs[rhs];
                    if ldata.is_flonum() || rdata.is_flonum() {
                        None // float folding would have to honor the FPU; left alone
                    } else if ldata.is_const() && rdata.is_const() {
                        eval_binary(op, ldata.fixed, rdata.fixed, unsigned).map(|v| {
                            let size = ra.vregs[dst].size;
                            let c = ra.constant(normalize(v, size, unsigned), size);
                            Inst::Mov { dst, src: c }
                        })
                    } else {
                        simplify_binary(ra, op, dst, lhs, rhs)
                    }
                }
                Inst::Unary { op, dst, src } => {
                    let (op, dst, src) = (*op, *dst, *src);
                    let sdata = &ra.vregs[src];
                    if sdata.is_const() && !sdata.is_flonum() {
                        let v = match op {
                            UnaryOp::Neg => sdata.fixed.wrapping_neg(),
                            UnaryOp::BitNot => !sdata.fixed,
                        };
                        let size = ra.vregs[dst].size;
                        let c = ra.constant(normalize(v, size, false), size);
                        Some(Inst::Mov { dst, src: c })
                    } else {
                        None
                    }
                }
                Inst::SetCond { cc, dst, lhs, rhs } => {
                    let (cc, dst, lhs, rhs) = (*cc, *dst, *lhs, *rhs);
                    let ldata = &ra.vregs[lhs];
                    let rdata = &ra.vregs[rhs];
                    if ldata.is_const() && rdata.is_const() && !ldata.is_flonum() {
                        let v = eval_compare(cc, ldata.fixed, rdata.fixed) as i64;
                        let c = ra.constant(v, ra.vregs[dst].size);
                        Some(Inst::Mov { dst, src: c })
                    } else {
                        None
                    }
                }
                Inst::Cast { dst, src, flags } => {
                    let (dst, src) = (*dst, *src);
                    let sdata = &ra.vregs[src];
                    if sdata.is_const() && !sdata.is_flonum() && !ra.vregs[dst].is_flonum() {
                        let size = ra.vregs[dst].size;
                        let unsigned = flags.contains(IrFlags::UNSIGNED);
                        let c = ra.constant(normalize(sdata.fixed, size, unsigned), size);
                        Some(Inst::Mov { dst, src: c })
                    } else {
                        None
                    }
                }
                _ => None,
            };
            if let Some(inst) = replacement {
                bbcon.blocks[bb].insts[idx] = inst;
                changed = true;
            }
        }
    }
    changed
}

/// Identities with one constant operand, and same-operand cancellations.
fn simplify_binary(
    ra: &mut RegAlloc,
    op: BinaryOp,
    dst: VReg,
    lhs: VReg,
    rhs: VReg,
) -> Option<Inst> {
    let size = ra.vregs[dst].size;
    let lconst = ra.vregs[lhs].is_const().then(|| ra.vregs[lhs].fixed);
    let rconst = ra.vregs[rhs].is_const().then(|| ra.vregs[rhs].fixed);

    let mov = |src| Some(Inst::Mov { dst, src });
    let zero = |ra: &mut RegAlloc| {
        let c = ra.constant(0, size);
        Some(Inst::Mov { dst, src: c })
    };

    match op {
        BinaryOp::Add => match (lconst, rconst) {
            (_, Some(0)) => mov(lhs),
            (Some(0), _) => mov(rhs),
            _ => None,
        },
        BinaryOp::Sub if lhs == rhs => zero(ra),
        BinaryOp::Sub if rconst == Some(0) => mov(lhs),
        BinaryOp::Mul => match (lconst, rconst) {
            (_, Some(1)) => mov(lhs),
            (Some(1), _) => mov(rhs),
            (_, Some(0)) | (Some(0), _) => zero(ra),
            _ => None,
        },
        BinaryOp::Div if rconst == Some(1) => mov(lhs),
        BinaryOp::BitAnd => match (lconst, rconst) {
            (_, Some(0)) | (Some(0), _) => zero(ra),
            (_, Some(-1)) => mov(lhs),
            (Some(-1), _) => mov(rhs),
            _ => None,
        },
        BinaryOp::BitOr => match (lconst, rconst) {
            (_, Some(0)) => mov(lhs),
            (Some(0), _) => mov(rhs),
            (_, Some(-1)) | (Some(-1), _) => {
                let c = ra.constant(normalize(-1, size, false), size);
                mov(c)
            }
            _ => None,
        },
        BinaryOp::BitXor if lhs == rhs => zero(ra),
        BinaryOp::BitXor if rconst == Some(0) => mov(lhs),
        BinaryOp::BitXor if lconst == Some(0) => mov(rhs),
        BinaryOp::LShift | BinaryOp::RShift if rconst == Some(0) => mov(lhs),
        _ => None,
    }
}

/// Replace uses of copy destinations with their sources. In SSA form a
/// `MOV a, b` makes `a` an alias for `b` everywhere.
fn propagate_copies(ra: &RegAlloc, bbcon: &mut BlockContainer) -> bool {
    let mut aliases: HashMap<VReg, VReg> = HashMap::new();
    for (_, inst) in bbcon.inst_iter() {
        if let Inst::Mov { dst, src } = inst {
            let d = &ra.vregs[*dst];
            let s = &ra.vregs[*src];
            // Float constants exist only as move sources; propagating them
            // into arithmetic would leave the emitters without a register.
            if s.is_const() && s.is_flonum() {
                continue;
            }
            if d.is_allocatable() && !d.flags.contains(VRegFlags::SPILLED) {
                aliases.insert(*dst, *src);
            }
        }
    }
    if aliases.is_empty() {
        return false;
    }
    let resolve = |mut v: VReg| {
        let mut hops = 0;
        while let Some(&next) = aliases.get(&v) {
            if next == v || hops > aliases.len() {
                break;
            }
            v = next;
            hops += 1;
        }
        v
    };

    let mut changed = false;
    let order = bbcon.order.clone();
    for &bb in &order {
        for inst in bbcon.blocks[bb].insts.iter_mut() {
            // Rewriting the Mov's own source is fine; rewriting its dst
            // is not, and dsts are not uses.
            inst.visit_uses_mut(|v| {
                let r = resolve(*v);
                if r != *v {
                    *v = r;
                    changed = true;
                }
            });
        }
    }
    changed
}

/// Evaluate branches whose condition folded to a constant.
fn simplify_branches(bbcon: &mut BlockContainer, ra: &RegAlloc) -> bool {
    enum Action {
        MakeUnconditional,
        Remove,
        Collapse(crate::ir::Block),
    }

    let mut changed = false;
    let order = bbcon.order.clone();
    for &bb in &order {
        let action = match bbcon.blocks[bb].insts.last() {
            Some(Inst::Branch {
                cc,
                lhs: Some(lhs),
                rhs: Some(rhs),
                ..
            }) if cc.is_compare() => {
                let l = &ra.vregs[*lhs];
                let r = &ra.vregs[*rhs];
                if l.is_const() && r.is_const() && !l.is_flonum() {
                    if eval_compare(*cc, l.fixed, r.fixed) {
                        Some(Action::MakeUnconditional)
                    } else {
                        Some(Action::Remove)
                    }
                } else {
                    None
                }
            }
            Some(Inst::Branch { cc, .. }) if cc.kind == CondKind::None => Some(Action::Remove),
            Some(Inst::BranchTable { index, targets }) if ra.vregs[*index].is_const() => {
                // A constant dispatch collapses to a plain jump. The guard
                // branch ahead of the table already filtered the range.
                let i = ra.vregs[*index].fixed.max(0) as usize;
                targets.get(i).copied().map(Action::Collapse)
            }
            _ => None,
        };
        match action {
            Some(Action::MakeUnconditional) => {
                if let Some(Inst::Branch { cc, lhs, rhs, .. }) =
                    bbcon.blocks[bb].insts.last_mut()
                {
                    *cc = CondCode::any();
                    *lhs = None;
                    *rhs = None;
                    changed = true;
                }
            }
            Some(Action::Remove) => {
                bbcon.blocks[bb].insts.pop();
                changed = true;
            }
            Some(Action::Collapse(dest)) => {
                if let Some(last) = bbcon.blocks[bb].insts.last_mut() {
                    *last = Inst::Branch {
                        cc: CondCode::any(),
                        lhs: None,
                        rhs: None,
                        dest,
                    };
                    changed = true;
                }
            }
            None => {}
        }
    }
    changed
}

/// Drop blocks that ended up empty and unreachable (lowering leaves one
/// behind every jump). Chains collapse over a couple of rounds.
pub(crate) fn prune_dead_blocks(bbcon: &mut BlockContainer) {
    loop {
        bbcon.compute_preds();
        let entry = match bbcon.entry() {
            Some(e) => e,
            None => return,
        };
        let before = bbcon.order.len();
        let blocks = &bbcon.blocks;
        let order = &mut bbcon.order;
        order.retain(|&bb| {
            bb == entry || !(blocks[bb].insts.is_empty() && blocks[bb].preds.is_empty())
        });
        if bbcon.order.len() == before {
            bbcon.compute_preds();
            return;
        }
    }
}

/// Remove instructions whose results are never read and which have no side
/// effects.
fn eliminate_dead_code(ra: &RegAlloc, bbcon: &mut BlockContainer) -> bool {
    let mut live: EntitySet<VReg> = EntitySet::new();
    for (_, inst) in bbcon.inst_iter() {
        inst.visit_uses(|v| {
            live.insert(v);
        });
    }
    let mut changed = false;
    let order = bbcon.order.clone();
    for &bb in &order {
        let before = bbcon.blocks[bb].insts.len();
        bbcon.blocks[bb].insts.retain(|inst| {
            if inst.has_side_effect() {
                return true;
            }
            match inst.dst() {
                Some(dst) => live.contains(dst) || ra.vregs[dst].flags.contains(VRegFlags::REF),
                None => true,
            }
        });
        changed |= bbcon.blocks[bb].insts.len() != before;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::CondCode;

    fn body_of(bbcon: &BlockContainer) -> &[Inst] {
        &bbcon.blocks[bbcon.order[0]].insts
    }

    #[test]
    fn folds_arithmetic_to_result() {
        // v = 40 + 2; result v
        let mut ra = RegAlloc::new();
        let a = ra.constant(40, VRegSize::B32);
        let b = ra.constant(2, VRegSize::B32);
        let v = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        let mut bbcon = BlockContainer::new();
        let bb = bbcon.add_block(".L0".to_string());
        bbcon.blocks[bb].insts.push(Inst::Binary {
            op: BinaryOp::Add,
            dst: v,
            lhs: a,
            rhs: b,
            flags: Default::default(),
        });
        bbcon.blocks[bb].insts.push(Inst::Result { dst: None, src: v });

        optimize(&mut ra, &mut bbcon);

        // The addition is gone; the result reads a constant 42 directly.
        match body_of(&bbcon) {
            [Inst::Result { src, .. }] => {
                assert!(ra.vregs[*src].is_const());
                assert_eq!(ra.vregs[*src].fixed, 42);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn folding_is_idempotent() {
        let mut ra = RegAlloc::new();
        let a = ra.constant(100, VRegSize::B32);
        let b = ra.constant(7, VRegSize::B32);
        let q = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        let one = ra.constant(1, VRegSize::B32);
        let r = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        let mut bbcon = BlockContainer::new();
        let bb = bbcon.add_block(".L0".to_string());
        bbcon.blocks[bb].insts.push(Inst::Binary {
            op: BinaryOp::Div,
            dst: q,
            lhs: a,
            rhs: b,
            flags: Default::default(),
        });
        bbcon.blocks[bb].insts.push(Inst::Binary {
            op: BinaryOp::Mul,
            dst: r,
            lhs: q,
            rhs: one,
            flags: Default::default(),
        });
        bbcon.blocks[bb].insts.push(Inst::Result { dst: None, src: r });

        optimize(&mut ra, &mut bbcon);
        let first = format!("{:?}", body_of(&bbcon));
        optimize(&mut ra, &mut bbcon);
        let second = format!("{:?}", body_of(&bbcon));
        assert_eq!(first, second);
        match body_of(&bbcon) {
            [Inst::Result { src, .. }] => assert_eq!(ra.vregs[*src].fixed, 14),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut ra = RegAlloc::new();
        let a = ra.constant(1, VRegSize::B32);
        let z = ra.constant(0, VRegSize::B32);
        let v = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        let mut bbcon = BlockContainer::new();
        let bb = bbcon.add_block(".L0".to_string());
        bbcon.blocks[bb].insts.push(Inst::Binary {
            op: BinaryOp::Div,
            dst: v,
            lhs: a,
            rhs: z,
            flags: Default::default(),
        });
        bbcon.blocks[bb].insts.push(Inst::Result { dst: None, src: v });
        optimize(&mut ra, &mut bbcon);
        assert!(matches!(body_of(&bbcon)[0], Inst::Binary { .. }));
    }

    #[test]
    fn constant_branch_becomes_unconditional() {
        let mut ra = RegAlloc::new();
        let a = ra.constant(1, VRegSize::B32);
        let b = ra.constant(2, VRegSize::B32);
        let mut bbcon = BlockContainer::new();
        let bb0 = bbcon.add_block(".L0".to_string());
        let bb1 = bbcon.add_block(".L1".to_string());
        let v = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        bbcon.blocks[bb0].insts.push(Inst::Branch {
            cc: CondCode::signed(CondKind::Lt),
            lhs: Some(a),
            rhs: Some(b),
            dest: bb1,
        });
        bbcon.blocks[bb1].insts.push(Inst::Mov { dst: v, src: a });
        bbcon.blocks[bb1].insts.push(Inst::Result { dst: None, src: v });

        optimize(&mut ra, &mut bbcon);
        match bbcon.blocks[bb0].insts.last() {
            Some(Inst::Branch { cc, lhs, .. }) => {
                assert_eq!(cc.kind, CondKind::Any);
                assert!(lhs.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
