//! Static single assignment construction and φ-resolution.
//!
//! Construction renames vregs so every one has exactly one definition:
//! a version stack per original vreg is seeded with version 0 for
//! parameters and address-taken values (REF bypasses SSA entirely), blocks
//! are walked in index order renaming uses to the top version and giving
//! each definition a fresh version, and every block with predecessors gets
//! fresh versions for its live-in vregs. Joins with two or more
//! predecessors then receive φ nodes pairing those fresh versions with the
//! versions live out of each predecessor; single-predecessor blocks forward
//! the predecessor's versions directly.
//!
//! A vreg can appear live-in without a definition on some path (a
//! potentially uninitialized local). The renaming silently leaves such
//! uses alone; this mirrors the C notion that reading an uninitialized
//! variable is the program's problem, not the compiler's.
//!
//! φ-resolution runs after optimization and lowers each φ into moves on the
//! incoming edges. The moves of one block form a parallel assignment: when
//! they swap values around a back edge, sequential emission would clobber,
//! so cycles are detected and broken with a temporary.

use std::collections::HashMap;

use chert_entity::EntityRef;
use log::trace;

use crate::ir::{Block, BlockContainer, Inst, VReg, VRegFlags};
use crate::liveness::analyze_reg_flow;
use crate::regalloc::RegAlloc;

/// Convert the IR to SSA form. Returns the per-block φ web implicitly (as
/// `Inst::Phi` at block heads).
pub fn make_ssa(ra: &mut RegAlloc, bbcon: &mut BlockContainer) {
    analyze_reg_flow(bbcon, ra);

    let orig_count = ra.vregs.len();
    let mut stacks: Vec<Vec<VReg>> = vec![Vec::new(); orig_count];
    for i in 0..orig_count {
        let v = VReg::from_u32(i as u32);
        if ra.vregs[v]
            .flags
            .intersects(VRegFlags::PARAM | VRegFlags::REF)
        {
            stacks[i].push(v);
        }
    }

    // Versions created for the live-ins of each block, and the version on
    // top of each stack when the block ends. Both keyed by original virt.
    let mut entry_versions: Vec<Vec<(VReg, VReg)>> = vec![Vec::new(); bbcon.order.len()];
    let mut exit_versions: Vec<HashMap<VReg, VReg>> = vec![HashMap::new(); bbcon.order.len()];

    let order = bbcon.order.clone();
    for (ibb, &bb) in order.iter().enumerate() {
        if ibb > 0 && !bbcon.blocks[bb].preds.is_empty() {
            let ins: Vec<VReg> = bbcon.blocks[bb].in_regs.iter().collect();
            for orig in ins {
                if ra.vregs[orig].flags.contains(VRegFlags::REF) {
                    continue;
                }
                let fresh = ra.with_version(orig, stacks[orig.index()].len() as u32);
                stacks[orig.index()].push(fresh);
                entry_versions[ibb].push((orig, fresh));
            }
        }

        let insts = &mut bbcon.blocks[bb].insts;
        for inst in insts.iter_mut() {
            inst.visit_uses_mut(|v| {
                let data = &ra.vregs[*v];
                if data.flags.intersects(VRegFlags::CONST | VRegFlags::REF) {
                    return;
                }
                // Tolerate an empty stack: potentially uninitialized local.
                if let Some(&top) = stacks[v.index()].last() {
                    *v = top;
                }
            });
            if let Some(dst) = inst.dst() {
                if !ra.vregs[dst]
                    .flags
                    .intersects(VRegFlags::CONST | VRegFlags::REF)
                {
                    let virt = dst.index();
                    let new_dst = if stacks[virt].is_empty() {
                        dst // the very first definition keeps version 0
                    } else {
                        ra.with_version(dst, stacks[virt].len() as u32)
                    };
                    stacks[virt].push(new_dst);
                    if let Some(d) = inst.dst_mut() {
                        *d = new_dst;
                    }
                }
            }
        }

        for i in 0..orig_count {
            if let Some(&top) = stacks[i].last() {
                exit_versions[ibb].insert(VReg::from_u32(i as u32), top);
            }
        }
    }

    // Insert φ nodes at joins; forward versions over single edges.
    let mut subst: HashMap<VReg, VReg> = HashMap::new();
    for (ibb, &bb) in order.iter().enumerate() {
        if entry_versions[ibb].is_empty() {
            continue;
        }
        let preds = bbcon.blocks[bb].preds.clone();
        let pred_indices: Vec<usize> = preds
            .iter()
            .map(|p| order.iter().position(|b| b == p).unwrap_or(0))
            .collect();

        let mut phis = Vec::new();
        for &(orig, fresh) in &entry_versions[ibb] {
            let args: Vec<VReg> = pred_indices
                .iter()
                .map(|&pi| {
                    // A predecessor without a version never defined the
                    // value on that path; let the φ carry itself there.
                    *exit_versions[pi].get(&orig).unwrap_or(&fresh)
                })
                .collect();
            let first = args[0];
            if preds.len() >= 2 && !args.iter().all(|&a| a == first) {
                phis.push(Inst::Phi { dst: fresh, args });
            } else {
                // Same version on every edge (or a single predecessor):
                // no φ needed, substitute the incoming version directly.
                subst.insert(fresh, first);
            }
        }
        let n = phis.len();
        let insts = &mut bbcon.blocks[bb].insts;
        phis.append(insts);
        *insts = phis;
        trace!("{}: inserted {} phi(s)", bbcon.blocks[bb].label, n);
    }

    // Apply the substitutions, following chains.
    if !subst.is_empty() {
        let resolve = |mut v: VReg| {
            while let Some(&next) = subst.get(&v) {
                if next == v {
                    break;
                }
                v = next;
            }
            v
        };
        for &bb in &order {
            for inst in bbcon.blocks[bb].insts.iter_mut() {
                inst.visit_uses_mut(|v| *v = resolve(*v));
            }
        }
    }
}

/// Lower every φ back to moves in the predecessors, resolving parallel-move
/// cycles with a temporary. After this pass no `Phi` remains.
pub fn resolve_phis(ra: &mut RegAlloc, bbcon: &mut BlockContainer) {
    let order = bbcon.order.clone();
    for &bb in &order {
        let phis: Vec<(VReg, Vec<VReg>)> = bbcon.blocks[bb]
            .insts
            .iter()
            .filter_map(|inst| match inst {
                Inst::Phi { dst, args } => Some((*dst, args.clone())),
                _ => None,
            })
            .collect();
        if phis.is_empty() {
            continue;
        }
        let preds = bbcon.blocks[bb].preds.clone();
        for phi in &phis {
            debug_assert_eq!(
                phi.1.len(),
                preds.len(),
                "phi argument count does not match predecessors"
            );
        }

        for (i, &pred) in preds.iter().enumerate() {
            let moves: Vec<(VReg, VReg)> = phis
                .iter()
                .map(|(dst, args)| (*dst, args[i]))
                .filter(|(dst, src)| dst != src)
                .collect();
            let seq = schedule_parallel_moves(ra, moves);
            insert_before_terminator(bbcon, pred, seq);
        }
        bbcon.blocks[bb]
            .insts
            .retain(|inst| !matches!(inst, Inst::Phi { .. }));
    }
}

/// Order a parallel assignment into sequential moves, breaking cycles with
/// a fresh temporary.
fn schedule_parallel_moves(ra: &mut RegAlloc, mut moves: Vec<(VReg, VReg)>) -> Vec<Inst> {
    let mut seq = Vec::new();
    while !moves.is_empty() {
        // A move whose destination nobody still reads is safe to emit.
        match moves
            .iter()
            .position(|&(dst, _)| !moves.iter().any(|&(_, src)| src == dst))
        {
            Some(i) => {
                let (dst, src) = moves.remove(i);
                seq.push(Inst::Mov { dst, src });
            }
            None => {
                // Every destination is also a pending source: a cycle.
                // Save one value in a temporary and redirect its readers.
                let (dst, _) = moves[0];
                let tmp = {
                    let data = ra.vregs[dst].clone();
                    ra.new_vreg(data.size, data.flags & VRegFlags::FLONUM)
                };
                seq.push(Inst::Mov { dst: tmp, src: dst });
                for (_, src) in moves.iter_mut() {
                    if *src == dst {
                        *src = tmp;
                    }
                }
            }
        }
    }
    seq
}

/// Append `insts` to `pred`, ahead of its trailing branch group so the
/// copies run on every outgoing edge. Copies for a sibling join write
/// versions that are dead on the other edges, so merging the groups at one
/// point is harmless.
fn insert_before_terminator(bbcon: &mut BlockContainer, pred: Block, insts: Vec<Inst>) {
    let at = bbcon.branch_group_start(pred);
    bbcon.blocks[pred].insts.splice(at..at, insts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, CondCode, CondKind, VRegSize};

    fn count_defs(bbcon: &BlockContainer, v: VReg) -> usize {
        bbcon
            .inst_iter()
            .filter(|(_, inst)| inst.dst() == Some(v))
            .count()
    }

    /// A summing loop: SSA must insert φs for the accumulator and the
    /// induction variable at the loop header, and every renamed vreg must
    /// have exactly one definition.
    #[test]
    fn loop_gets_phis_and_single_defs() {
        let mut ra = RegAlloc::new();
        let n = ra.new_vreg(VRegSize::B32, VRegFlags::PARAM);
        let s = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        let i = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        let zero = ra.constant(0, VRegSize::B32);
        let one = ra.constant(1, VRegSize::B32);

        let mut bbcon = BlockContainer::new();
        let entry = bbcon.add_block(".L0".to_string());
        let header = bbcon.add_block(".L1".to_string());
        let body = bbcon.add_block(".L2".to_string());
        let exit = bbcon.add_block(".L3".to_string());

        bbcon.blocks[entry].insts.push(Inst::Mov { dst: s, src: zero });
        bbcon.blocks[entry].insts.push(Inst::Mov { dst: i, src: zero });
        bbcon.blocks[header].insts.push(Inst::Branch {
            cc: CondCode::signed(CondKind::Ge),
            lhs: Some(i),
            rhs: Some(n),
            dest: exit,
        });
        bbcon.blocks[body].insts.push(Inst::Binary {
            op: BinaryOp::Add,
            dst: s,
            lhs: s,
            rhs: i,
            flags: Default::default(),
        });
        bbcon.blocks[body].insts.push(Inst::Binary {
            op: BinaryOp::Add,
            dst: i,
            lhs: i,
            rhs: one,
            flags: Default::default(),
        });
        bbcon.blocks[body].insts.push(Inst::Branch {
            cc: CondCode::any(),
            lhs: None,
            rhs: None,
            dest: header,
        });
        bbcon.blocks[exit].insts.push(Inst::Result { dst: None, src: s });

        make_ssa(&mut ra, &mut bbcon);

        let header_phis = bbcon.blocks[header]
            .insts
            .iter()
            .filter(|i| matches!(i, Inst::Phi { .. }))
            .count();
        assert_eq!(header_phis, 2, "expected phis for s and i at the header");

        for (v, data) in ra.vregs.iter() {
            if data.is_allocatable() && !data.flags.contains(VRegFlags::PARAM) {
                assert!(
                    count_defs(&bbcon, v) <= 1,
                    "{} defined more than once after SSA",
                    v
                );
            }
        }

        // Lower the φs back out and make sure none survive and each
        // predecessor got its copies ahead of the branch.
        resolve_phis(&mut ra, &mut bbcon);
        assert!(bbcon
            .inst_iter()
            .all(|(_, inst)| !matches!(inst, Inst::Phi { .. })));
        let body_insts = &bbcon.blocks[body].insts;
        assert!(body_insts.last().map_or(false, Inst::is_branch));
        let movs = body_insts
            .iter()
            .filter(|i| matches!(i, Inst::Mov { .. }))
            .count();
        assert!(movs >= 2, "edge copies must precede the back edge");
    }

    /// A swap across a back edge must go through a temporary, not clobber.
    #[test]
    fn parallel_move_cycle_is_broken() {
        let mut ra = RegAlloc::new();
        let a = ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        let b = ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        let seq = schedule_parallel_moves(&mut ra, vec![(a, b), (b, a)]);
        assert_eq!(seq.len(), 3, "cycle of two needs a temp and three moves");
        // The first move must save one side into the temp.
        match &seq[0] {
            Inst::Mov { dst, src } => {
                assert!(*dst != a && *dst != b);
                assert!(*src == a || *src == b);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
