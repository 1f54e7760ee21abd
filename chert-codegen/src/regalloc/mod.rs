//! Linear-scan register allocation.
//!
//! The allocator owns the virtual register pool for one function. After the
//! optimizer has taken the IR back out of SSA form and liveness has been
//! computed, `alloc_physical_registers` numbers every instruction, builds
//! one live interval per vreg, and walks the intervals in ascending start
//! order handing out physical registers; when the register file runs dry the
//! interval with the farthest end is demoted to a stack slot.
//!
//! Fixed-register machine idioms (the x86 division pair, the shift count in
//! CL, argument registers inside a call sequence) are modeled as
//! per-interval `occupied` masks supplied by the target: an interval crossing
//! such an instruction never receives one of the occupied registers.

use chert_entity::{EntityRef, PrimaryMap};
use log::debug;
use smallvec::SmallVec;

use crate::ir::{BlockContainer, Inst, PhysReg, RegBits, VReg, VRegData, VRegFlags, VRegSize};
use crate::isa::TargetIsa;

/// Whether an interval ended up in a register or on the stack.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IntervalState {
    /// Carried in a physical register.
    Normal,
    /// Demoted to a frame slot.
    Spill,
}

/// The live range of one virtual register, in linearized instruction
/// indices over the whole function.
#[derive(Clone, Debug)]
pub struct LiveInterval {
    /// The vreg this interval describes.
    pub virt: VReg,
    /// First instruction index at which the vreg is live.
    pub start: i32,
    /// Last instruction index at which the vreg is live.
    pub end: i32,
    /// Allocation outcome.
    pub state: IntervalState,
    /// Assigned physical register while `state` is `Normal`.
    pub phys: Option<PhysReg>,
    /// Physical registers this interval must not use.
    pub occupied: RegBits,
}

impl LiveInterval {
    fn unused(virt: VReg) -> LiveInterval {
        LiveInterval {
            virt,
            start: i32::MAX,
            end: -1,
            state: IntervalState::Normal,
            phys: None,
            occupied: 0,
        }
    }

    fn touch(&mut self, nip: i32) {
        if nip < self.start {
            self.start = nip;
        }
        if nip > self.end {
            self.end = nip;
        }
    }

    /// Does this interval cover any instruction at all?
    pub fn is_live(&self) -> bool {
        self.end >= self.start
    }

    fn crosses(&self, nip: i32) -> bool {
        self.start < nip && nip < self.end
    }
}

bitflags::bitflags! {
    /// Facts the allocator learns that the emitter needs.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct RegAllocFlags: u8 {
        /// The function needs a real frame pointer (address-taken locals,
        /// spills, or dynamic stack adjustment).
        const STACK_FRAME = 1 << 0;
    }
}

/// Register allocator state and the function's virtual register pool.
#[derive(Debug, Default)]
pub struct RegAlloc {
    /// All virtual registers of the function.
    pub vregs: PrimaryMap<VReg, VRegData>,
    /// One interval per vreg, indexed by entity.
    pub intervals: Vec<LiveInterval>,
    /// Interval indices sorted by ascending `(start, end)`.
    pub sorted: Vec<usize>,
    /// Callee-save bookkeeping: integer registers ever assigned.
    pub used_reg_bits: RegBits,
    /// Floating point registers ever assigned.
    pub used_freg_bits: RegBits,
    /// Allocation-wide flags.
    pub flags: RegAllocFlags,
}

impl RegAlloc {
    /// Create an empty allocator.
    pub fn new() -> RegAlloc {
        Default::default()
    }

    /// Spawn a fresh virtual register.
    pub fn new_vreg(&mut self, size: VRegSize, flags: VRegFlags) -> VReg {
        let virt = self.vregs.next_key();
        self.vregs.push(VRegData {
            size,
            flags,
            version: 0,
            orig: virt,
            phys: None,
            fixed: 0,
            offset: 0,
            param: None,
        })
    }

    /// Spawn a constant vreg. Constants have no liveness and no register.
    pub fn constant(&mut self, value: i64, size: VRegSize) -> VReg {
        let v = self.new_vreg(size, VRegFlags::CONST);
        self.vregs[v].fixed = value;
        v
    }

    /// Spawn a constant vreg with extra flags (FLONUM/UNSIGNED).
    pub fn constant_with(&mut self, value: i64, size: VRegSize, flags: VRegFlags) -> VReg {
        let v = self.new_vreg(size, flags | VRegFlags::CONST);
        self.vregs[v].fixed = value;
        v
    }

    /// Spawn a new SSA version of `orig`.
    pub fn with_version(&mut self, orig: VReg, version: u32) -> VReg {
        let mut data = self.vregs[orig].clone();
        data.version = version;
        data.orig = orig;
        let v = self.vregs.push(data);
        v
    }

    /// Convenience accessor.
    pub fn vreg(&self, v: VReg) -> &VRegData {
        &self.vregs[v]
    }

    /// Assign a linear index to every instruction and compute each vreg's
    /// live interval from defs, uses, and the per-block liveness sets.
    fn build_intervals(&mut self, bbcon: &BlockContainer) {
        self.intervals = self
            .vregs
            .keys()
            .map(LiveInterval::unused)
            .collect();

        // Parameters are defined by the calling convention at entry.
        for (v, data) in self.vregs.iter() {
            if data.flags.contains(VRegFlags::PARAM) && data.is_allocatable() {
                self.intervals[v.index()].touch(0);
            }
        }

        let mut nip: i32 = 0;
        for &bb in &bbcon.order {
            let data = &bbcon.blocks[bb];
            let bb_start = nip;
            let bb_end = nip + (data.insts.len() as i32 - 1).max(0);
            for v in data.in_regs.iter() {
                if self.vregs[v].is_allocatable() {
                    self.intervals[v.index()].touch(bb_start);
                }
            }
            for v in data.out_regs.iter() {
                if self.vregs[v].is_allocatable() {
                    self.intervals[v.index()].touch(bb_end);
                }
            }
            for inst in &data.insts {
                inst.visit_uses(|v| {
                    if self.vregs[v].is_allocatable() {
                        self.intervals[v.index()].touch(nip);
                    }
                });
                if let Some(dst) = inst.dst() {
                    if self.vregs[dst].is_allocatable() {
                        self.intervals[dst.index()].touch(nip);
                    }
                }
                nip += 1;
            }
        }
    }

    /// Fold fixed-register constraints into the intervals: at every
    /// instruction with an occupied mask, forbid those registers to all
    /// intervals strictly crossing it.
    fn apply_occupied_masks(&mut self, bbcon: &BlockContainer, isa: &dyn TargetIsa) {
        // The prologue reads the ABI argument registers one after another,
        // so no parameter may land in another parameter's incoming
        // register; its own is fine.
        let int_arg_mask: RegBits = isa
            .int_arg_regs()
            .iter()
            .fold(0, |mask, &p| mask | (1 << p));
        let float_arg_mask: RegBits = (1 << isa.float_arg_reg_count()) - 1;
        for li in self.intervals.iter_mut() {
            let data = &self.vregs[li.virt];
            if !data.flags.contains(VRegFlags::PARAM) {
                continue;
            }
            if data.is_flonum() {
                let own = data.param.map(|i| 1 << i).unwrap_or(0);
                li.occupied |= float_arg_mask & !own;
            } else {
                let own = data
                    .param
                    .and_then(|i| isa.int_arg_regs().get(i as usize))
                    .map(|&p| 1 << p)
                    .unwrap_or(0);
                li.occupied |= int_arg_mask & !own;
            }
        }

        let mut nip: i32 = 0;
        for (_, inst) in bbcon.inst_iter() {
            let mut mask = isa.inst_occupied_mask(inst, self);
            let mut fmask = isa.inst_occupied_fmask(inst, self);
            if let Inst::Call { .. } = inst {
                mask |= isa.call_clobber_mask();
                fmask |= isa.call_clobber_fmask();
            }
            if mask != 0 || fmask != 0 {
                for li in self.intervals.iter_mut() {
                    if !li.crosses(nip) {
                        continue;
                    }
                    if self.vregs[li.virt].is_flonum() {
                        li.occupied |= fmask;
                    } else {
                        li.occupied |= mask;
                    }
                }
            }
            nip += 1;
        }
    }

    /// Run the linear scan over the intervals.
    fn linear_scan(&mut self, isa: &dyn TargetIsa) {
        let int_all: RegBits = (1 << isa.int_reg_count()) - 1;
        let float_all: RegBits = (1 << isa.float_reg_count()) - 1;
        let mut free = [int_all, float_all];

        self.sorted = (0..self.intervals.len())
            .filter(|&i| {
                let li = &self.intervals[i];
                li.is_live() && self.vregs[li.virt].is_allocatable()
            })
            .collect();
        let intervals = &self.intervals;
        self.sorted
            .sort_by_key(|&i| (intervals[i].start, intervals[i].end));

        // Active intervals, kept sorted by ascending end.
        let mut active: SmallVec<[usize; 16]> = SmallVec::new();

        for pos in 0..self.sorted.len() {
            let cur = self.sorted[pos];
            let start = self.intervals[cur].start;

            // Expire old intervals.
            while let Some(&j) = active.first() {
                if self.intervals[j].end >= start {
                    break;
                }
                active.remove(0);
                if let Some(phys) = self.intervals[j].phys {
                    let class = self.vregs[self.intervals[j].virt].is_flonum() as usize;
                    free[class] |= 1 << phys;
                }
            }

            let class = self.vregs[self.intervals[cur].virt].is_flonum() as usize;
            let usable = free[class] & !self.intervals[cur].occupied;
            if usable != 0 {
                let phys = usable.trailing_zeros() as PhysReg;
                free[class] &= !(1 << phys);
                self.intervals[cur].phys = Some(phys);
                let end = self.intervals[cur].end;
                let at = active
                    .iter()
                    .position(|&j| self.intervals[j].end > end)
                    .unwrap_or(active.len());
                active.insert(at, cur);
            } else {
                // Spill the interval of this class with the farthest end,
                // current included. Only intervals holding a register the
                // current one is allowed to take are eviction candidates:
                // inheriting a register from `occupied` would violate the
                // fixed-register contract.
                let occupied = self.intervals[cur].occupied;
                let victim = active
                    .iter()
                    .copied()
                    .filter(|&j| self.vregs[self.intervals[j].virt].is_flonum() as usize == class)
                    .filter(|&j| {
                        self.intervals[j]
                            .phys
                            .map_or(false, |p| occupied & (1 << p) == 0)
                    })
                    .max_by_key(|&j| self.intervals[j].end)
                    .filter(|&j| self.intervals[j].end > self.intervals[cur].end);
                match victim {
                    Some(j) => {
                        let phys = self.intervals[j].phys.take();
                        self.intervals[j].state = IntervalState::Spill;
                        active.retain(|k| *k != j);
                        debug!(
                            "spill {} (end {}) in favor of {}",
                            self.intervals[j].virt, self.intervals[j].end,
                            self.intervals[cur].virt
                        );
                        self.intervals[cur].phys = phys;
                        let end = self.intervals[cur].end;
                        let at = active
                            .iter()
                            .position(|&k| self.intervals[k].end > end)
                            .unwrap_or(active.len());
                        active.insert(at, cur);
                    }
                    None => {
                        self.intervals[cur].state = IntervalState::Spill;
                        debug!("spill {} (no candidate)", self.intervals[cur].virt);
                    }
                }
            }
        }
    }

    /// Allocate physical registers for every allocatable vreg.
    pub fn alloc_physical_registers(&mut self, bbcon: &BlockContainer, isa: &dyn TargetIsa) {
        self.build_intervals(bbcon);
        self.apply_occupied_masks(bbcon, isa);
        self.linear_scan(isa);
    }

    /// Copy allocation results into the vreg pool: either a physical
    /// register or the SPILLED flag.
    pub fn map_virtual_to_physical(&mut self) {
        let mut spills = 0;
        for li in &self.intervals {
            if !li.is_live() {
                continue;
            }
            let data = &mut self.vregs[li.virt];
            match li.state {
                IntervalState::Normal => data.phys = li.phys,
                IntervalState::Spill => {
                    data.flags |= VRegFlags::SPILLED;
                    spills += 1;
                }
            }
        }
        if spills > 0 {
            self.flags |= RegAllocFlags::STACK_FRAME;
        }
        debug!("allocated {} vregs, {} spilled", self.vregs.len(), spills);
    }

    /// Record which registers were ever assigned, for the prologue's
    /// callee-save decision.
    pub fn detect_used_registers(&mut self) {
        for li in &self.intervals {
            if let Some(phys) = li.phys {
                if self.vregs[li.virt].is_flonum() {
                    self.used_freg_bits |= 1 << phys;
                } else {
                    self.used_reg_bits |= 1 << phys;
                }
            }
        }
    }

    /// Spawn a scratch vreg mirroring `spilled`, pinned to a reserved
    /// scratch register outside the allocatable range.
    fn scratch_for(&mut self, spilled: VReg, slot: usize, isa: &dyn TargetIsa) -> VReg {
        let data = self.vregs[spilled].clone();
        let base = if data.is_flonum() {
            isa.float_reg_count()
        } else {
            isa.int_reg_count()
        };
        let scratch = self.new_vreg(data.size, data.flags & VRegFlags::FLONUM);
        self.vregs[scratch].phys = Some((base + slot) as PhysReg);
        scratch
    }

    /// Rewrite spilled operands into explicit spill-slot traffic through the
    /// reserved scratch registers, which are outside the allocatable range.
    pub fn insert_spill_code(&mut self, bbcon: &mut BlockContainer, isa: &dyn TargetIsa) {
        let order = bbcon.order.clone();
        for bb in order {
            let insts = std::mem::take(&mut bbcon.blocks[bb].insts);
            let mut rewritten = Vec::with_capacity(insts.len());
            for mut inst in insts {
                if matches!(inst, Inst::Keep { .. }) {
                    // Liveness-only; nothing to reload.
                    rewritten.push(inst);
                    continue;
                }

                // Reload spilled sources. A vreg read twice reloads once.
                let mut spilled_uses: SmallVec<[VReg; 2]> = SmallVec::new();
                inst.visit_uses(|v| {
                    if self.vregs[v].flags.contains(VRegFlags::SPILLED)
                        && !spilled_uses.contains(&v)
                    {
                        spilled_uses.push(v);
                    }
                });
                debug_assert!(spilled_uses.len() <= 2, "more than two spilled operands");
                let mut replacements: SmallVec<[(VReg, VReg); 2]> = SmallVec::new();
                for (slot, &spilled) in spilled_uses.iter().enumerate() {
                    let scratch = self.scratch_for(spilled, slot, isa);
                    rewritten.push(Inst::LoadSpill {
                        dst: scratch,
                        src: spilled,
                    });
                    replacements.push((spilled, scratch));
                }
                if !replacements.is_empty() {
                    inst.visit_uses_mut(|v| {
                        if let Some(&(_, scratch)) =
                            replacements.iter().find(|&&(from, _)| from == *v)
                        {
                            *v = scratch;
                        }
                    });
                }

                // Route a spilled destination through a scratch and store it.
                let mut store_after = None;
                if let Some(dst) = inst.dst() {
                    if self.vregs[dst].flags.contains(VRegFlags::SPILLED) {
                        let scratch = self.scratch_for(dst, 0, isa);
                        if let Some(d) = inst.dst_mut() {
                            *d = scratch;
                        }
                        store_after = Some(Inst::StoreSpill { dst, src: scratch });
                    }
                }

                rewritten.push(inst);
                if let Some(store) = store_after {
                    rewritten.push(store);
                }
            }
            bbcon.blocks[bb].insts = rewritten;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::VRegSize;
    use crate::isa::x64::X64Backend;

    /// Saturate the integer file with long-lived values, then allocate a
    /// short interval that is forbidden its farthest-ending competitor's
    /// register: eviction must pick the next-farthest admissible victim,
    /// never hand over a register from the occupied mask.
    #[test]
    fn eviction_respects_the_occupied_mask() {
        let isa = X64Backend::new();
        let mut ra = RegAlloc::new();
        let virts: Vec<VReg> = (0..13)
            .map(|_| ra.new_vreg(VRegSize::B64, VRegFlags::empty()))
            .collect();
        ra.intervals = virts
            .iter()
            .enumerate()
            .map(|(i, &v)| LiveInterval {
                virt: v,
                start: if i == 12 { 10 } else { 0 },
                end: if i == 12 { 50 } else { 100 + i as i32 },
                state: IntervalState::Normal,
                phys: None,
                occupied: if i == 12 { 1 << 11 } else { 0 },
            })
            .collect();

        ra.linear_scan(&isa);

        // The twelve long-lived values take the whole register file, in
        // ascending-end order.
        assert_eq!(ra.intervals[0].phys, Some(0));
        assert_eq!(ra.intervals[11].phys, Some(11));
        // The newcomer ends before all of them. Interval 11 ends farthest
        // but sits in the forbidden register, so interval 10 is the one
        // spilled and its register changes hands.
        assert_eq!(ra.intervals[12].phys, Some(10));
        assert_eq!(ra.intervals[10].state, IntervalState::Spill);
        assert_eq!(ra.intervals[11].state, IntervalState::Normal);
        for li in &ra.intervals {
            if let Some(p) = li.phys {
                assert_eq!(li.occupied & (1 << p), 0, "{} in occupied register", li.virt);
            }
        }
    }
}
