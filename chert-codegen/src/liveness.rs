//! Register flow (liveness) analysis.
//!
//! Standard backward dataflow over the basic blocks:
//!
//! ```text
//! use(bb)  = vregs read before being written in bb
//! def(bb)  = vregs written in bb
//! in(bb)   = use(bb) ∪ (out(bb) \ def(bb))
//! out(bb)  = ⋃ in(succ) over the successors
//! ```
//!
//! iterated to a fixed point. Constants carry no liveness and address-taken
//! (REF) vregs are excluded from allocation, so both stay out of the sets.
//! `assigned_regs` records every vreg written in the block, which the SSA
//! pass needs independently of the equations.

use chert_entity::EntitySet;
use log::trace;

use crate::ir::{BlockContainer, VReg};
use crate::regalloc::RegAlloc;

/// Compute `in_regs`, `out_regs` and `assigned_regs` for every block.
pub fn analyze_reg_flow(bbcon: &mut BlockContainer, ra: &RegAlloc) {
    bbcon.compute_preds();

    let nblocks = bbcon.order.len();
    let mut uses: Vec<EntitySet<VReg>> = vec![EntitySet::new(); nblocks];
    let mut defs: Vec<EntitySet<VReg>> = vec![EntitySet::new(); nblocks];

    for (i, &bb) in bbcon.order.iter().enumerate() {
        let data = &mut bbcon.blocks[bb];
        data.in_regs.clear();
        data.out_regs.clear();
        data.assigned_regs.clear();
        for inst in &data.insts {
            inst.visit_uses(|v| {
                if ra.vregs[v].is_allocatable() && !defs[i].contains(v) {
                    uses[i].insert(v);
                }
            });
            if let Some(dst) = inst.dst() {
                if ra.vregs[dst].is_allocatable() {
                    defs[i].insert(dst);
                    data.assigned_regs.insert(dst);
                }
            }
        }
    }

    // Iterate until nothing changes. Visiting in reverse order converges
    // quickly for reducible control flow.
    let mut changed = true;
    let mut rounds = 0;
    while changed {
        changed = false;
        rounds += 1;
        for i in (0..nblocks).rev() {
            let bb = bbcon.order[i];
            let mut out = EntitySet::new();
            for succ in bbcon.succs(bb) {
                out.union_with(&bbcon.blocks[succ].in_regs);
            }
            let mut inset = out.clone();
            inset.difference_with(&defs[i]);
            inset.union_with(&uses[i]);

            let data = &mut bbcon.blocks[bb];
            if out != data.out_regs {
                data.out_regs = out;
                changed = true;
            }
            if inset != data.in_regs {
                data.in_regs = inset;
                changed = true;
            }
        }
    }
    trace!("liveness converged after {} rounds", rounds);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockContainer, CondCode, CondKind, Inst, VRegFlags, VRegSize};

    #[test]
    fn loop_carried_value_is_live_around_the_backedge() {
        // entry: v0 = v1 (param)         header: branch v0 < v2 -> body
        // body:  v0 = v0 + v3, jmp header
        // exit:  result v0
        let mut ra = RegAlloc::new();
        let param = ra.new_vreg(VRegSize::B32, VRegFlags::PARAM);
        let v0 = ra.new_vreg(VRegSize::B32, VRegFlags::empty());
        let limit = ra.constant(10, VRegSize::B32);
        let step = ra.constant(1, VRegSize::B32);

        let mut bbcon = BlockContainer::new();
        let entry = bbcon.add_block(".L0".to_string());
        let header = bbcon.add_block(".L1".to_string());
        let body = bbcon.add_block(".L2".to_string());
        let exit = bbcon.add_block(".L3".to_string());

        bbcon.blocks[entry].insts.push(Inst::Mov { dst: v0, src: param });
        bbcon.blocks[header].insts.push(Inst::Branch {
            cc: CondCode::signed(CondKind::Ge),
            lhs: Some(v0),
            rhs: Some(limit),
            dest: exit,
        });
        bbcon.blocks[body].insts.push(Inst::Binary {
            op: crate::ir::BinaryOp::Add,
            dst: v0,
            lhs: v0,
            rhs: step,
            flags: Default::default(),
        });
        bbcon.blocks[body].insts.push(Inst::Branch {
            cc: CondCode::any(),
            lhs: None,
            rhs: None,
            dest: header,
        });
        bbcon.blocks[exit].insts.push(Inst::Result { dst: None, src: v0 });

        analyze_reg_flow(&mut bbcon, &ra);

        // v0 flows around the loop; the constants never enter the sets.
        assert!(bbcon.blocks[header].in_regs.contains(v0));
        assert!(bbcon.blocks[header].out_regs.contains(v0));
        assert!(bbcon.blocks[body].out_regs.contains(v0));
        assert!(bbcon.blocks[exit].in_regs.contains(v0));
        assert!(!bbcon.blocks[header].in_regs.contains(limit));
        // The parameter dies in the entry block.
        assert!(!bbcon.blocks[header].in_regs.contains(param));
        assert!(bbcon.blocks[body].assigned_regs.contains(v0));
        // Predecessors were recomputed along the way.
        assert_eq!(bbcon.blocks[header].preds.len(), 2);
    }
}
