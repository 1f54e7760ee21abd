//! The RISC-V 64 backend (RV64GC, LP64D ABI).
//!
//! A deliberately plainer peer of the x86-64 backend: there are no
//! fixed-register idioms (`div`, `rem` and the shifts take any registers),
//! so the occupied masks cover only the argument registers inside call
//! sequences. Physical numbering puts `a0..a7` first, then the callee-saved
//! `s1..s11`; `t5`/`t6` are the spill scratch pair, and `t0` is free for
//! sequences that need one more temporary. `s0` is the frame pointer and is
//! never allocated.

use std::io::Write;

use crate::ir::{
    BinaryOp, Block, CallTarget, CondCode, CondKind, FuncBackend, Inst, IrFlags, PhysReg,
    RegBits, UnaryOp, VReg, VRegFlags, VRegSize,
};
use crate::isa::TargetIsa;
use crate::regalloc::{RegAlloc, RegAllocFlags};
use crate::CodegenResult;
use chert_ast::{Function, GlobalVar, Initializer, Stmt, Storage};

const INT_REG_COUNT: usize = 19;
const FLOAT_REG_COUNT: usize = 20;
const MAX_REG_ARGS: usize = 8;
const MAX_FREG_ARGS: usize = 8;

static INT_REGS: [&str; 21] = [
    "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", // arguments, caller-saved
    "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", // callee-saved
    "t5", "t6", // spill scratch
];

static FLOAT_REGS: [&str; 22] = [
    "fa0", "fa1", "fa2", "fa3", "fa4", "fa5", "fa6", "fa7", //
    "fs0", "fs1", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9", "fs10", "fs11", //
    "ft10", "ft11",
];

static ARG_REGS: [PhysReg; MAX_REG_ARGS] = [0, 1, 2, 3, 4, 5, 6, 7];

/// s1..s11.
const CALLEE_SAVED: RegBits = 0b111_1111_1111 << 8;
/// a0..a7 (the allocatable caller-saved set).
const CALLER_SAVED: RegBits = 0xFF;
/// fs0..fs11.
const CALLEE_SAVED_F: RegBits = 0b1111_1111_1111 << 8;

fn r(phys: PhysReg) -> &'static str {
    INT_REGS[phys as usize]
}

fn f(phys: PhysReg) -> &'static str {
    FLOAT_REGS[phys as usize]
}

/// The RISC-V 64 code generator.
pub struct Riscv64Backend(());

impl Riscv64Backend {
    /// Create the backend.
    pub fn new() -> Riscv64Backend {
        Riscv64Backend(())
    }
}

impl TargetIsa for Riscv64Backend {
    fn name(&self) -> &'static str {
        "riscv64"
    }

    fn int_reg_count(&self) -> usize {
        INT_REG_COUNT
    }

    fn float_reg_count(&self) -> usize {
        FLOAT_REG_COUNT
    }

    fn int_arg_regs(&self) -> &'static [PhysReg] {
        &ARG_REGS
    }

    fn float_arg_reg_count(&self) -> usize {
        MAX_FREG_ARGS
    }

    fn callee_saved_mask(&self) -> RegBits {
        CALLEE_SAVED
    }

    fn callee_saved_fmask(&self) -> RegBits {
        CALLEE_SAVED_F
    }

    fn call_clobber_mask(&self) -> RegBits {
        CALLER_SAVED
    }

    fn call_clobber_fmask(&self) -> RegBits {
        0xFF
    }

    fn inst_occupied_mask(&self, inst: &Inst, ra: &RegAlloc) -> RegBits {
        match inst {
            Inst::PushArg { index, src } if !ra.vregs[*src].is_flonum() => {
                ARG_REGS.get(*index).map(|&p| 1 << p).unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn inst_occupied_fmask(&self, inst: &Inst, ra: &RegAlloc) -> RegBits {
        match inst {
            Inst::PushArg { index, src }
                if ra.vregs[*src].is_flonum() && *index < MAX_FREG_ARGS =>
            {
                1 << index
            }
            _ => 0,
        }
    }

    fn stack_param_base(&self) -> i32 {
        // Incoming stack arguments begin right at the frame pointer.
        0
    }

    fn vaarg_save_area_size(&self) -> usize {
        MAX_REG_ARGS * 8
    }

    fn vaarg_start_offset(&self, ireg_params: usize) -> i32 {
        ((ireg_params as i32) - MAX_REG_ARGS as i32) * 8
    }

    fn emit_function(
        &self,
        out: &mut dyn Write,
        func: &Function,
        fnbe: &mut FuncBackend,
    ) -> CodegenResult<()> {
        FuncEmitter {
            out,
            func,
            fnbe,
            next_local: 0,
        }
        .emit()
    }

    fn emit_global(&self, out: &mut dyn Write, gvar: &GlobalVar) -> CodegenResult<()> {
        if gvar.storage.contains(Storage::EXTERN) {
            return Ok(());
        }
        let align = gvar.ty.align(8).max(1);
        let size = gvar.ty.size(8).max(1);
        if gvar.init.is_none() {
            if gvar.storage.contains(Storage::STATIC) {
                writeln!(out, "\t.local\t{}", gvar.name)?;
            }
            writeln!(out, "\t.comm\t{},{},{}", gvar.name, size, align)?;
            return Ok(());
        }
        writeln!(out, "\t.data")?;
        if !gvar.storage.contains(Storage::STATIC) {
            writeln!(out, "\t.globl\t{}", gvar.name)?;
        }
        writeln!(out, "\t.align\t{}", align.trailing_zeros())?;
        writeln!(out, "{}:", gvar.name)?;
        if let Some(init) = &gvar.init {
            emit_initializer(out, init, &gvar.ty)?;
        }
        Ok(())
    }

    fn emit_rodata(&self, out: &mut dyn Write, label: &str, bytes: &[u8]) -> CodegenResult<()> {
        writeln!(out, "\t.section\t.rodata")?;
        writeln!(out, "{}:", label)?;
        for chunk in bytes.chunks(16) {
            let list: Vec<String> = chunk.iter().map(|b| format!("0x{:02x}", b)).collect();
            writeln!(out, "\t.byte\t{}", list.join(","))?;
        }
        Ok(())
    }
}

fn emit_initializer(
    out: &mut dyn Write,
    init: &Initializer,
    ty: &chert_ast::Type,
) -> CodegenResult<()> {
    match init {
        Initializer::Fixnum(v) => {
            let directive = match ty.size(8) {
                1 => ".byte",
                2 => ".half",
                4 => ".word",
                _ => ".quad",
            };
            writeln!(out, "\t{}\t{}", directive, v)?;
        }
        Initializer::Flonum(v) => {
            if ty.size(8) == 4 {
                writeln!(out, "\t.word\t0x{:08x}", (*v as f32).to_bits())?;
            } else {
                writeln!(out, "\t.quad\t0x{:016x}", v.to_bits())?;
            }
        }
        Initializer::Label(name, offset) => {
            if *offset == 0 {
                writeln!(out, "\t.quad\t{}", name)?;
            } else {
                writeln!(out, "\t.quad\t{}{:+}", name, offset)?;
            }
        }
        Initializer::Str(bytes) => {
            for chunk in bytes.chunks(16) {
                let list: Vec<String> = chunk.iter().map(|b| format!("0x{:02x}", b)).collect();
                writeln!(out, "\t.byte\t{}", list.join(","))?;
            }
        }
        Initializer::List(items) => {
            let elem_ty = ty.pointee().cloned();
            for item in items {
                match &elem_ty {
                    Some(et) => emit_initializer(out, item, et)?,
                    None => emit_initializer(out, item, ty)?,
                }
            }
        }
    }
    Ok(())
}

struct FuncEmitter<'a> {
    out: &'a mut dyn Write,
    func: &'a Function,
    fnbe: &'a mut FuncBackend,
    next_local: u32,
}

impl<'a> FuncEmitter<'a> {
    fn ra(&self) -> &RegAlloc {
        &self.fnbe.ra
    }

    fn phys(&self, v: VReg) -> PhysReg {
        match self.ra().vregs[v].phys {
            Some(p) => p,
            None => panic!("{} has no physical register at emission", v),
        }
    }

    fn is_const(&self, v: VReg) -> bool {
        self.ra().vregs[v].is_const()
    }

    fn cval(&self, v: VReg) -> i64 {
        self.ra().vregs[v].fixed
    }

    fn is_flo(&self, v: VReg) -> bool {
        self.ra().vregs[v].is_flonum()
    }

    fn size(&self, v: VReg) -> VRegSize {
        self.ra().vregs[v].size
    }

    fn local_label(&mut self, tag: &str) -> String {
        let n = self.next_local;
        self.next_local += 1;
        format!(".L{}_{}{}", self.func.name, tag, n)
    }

    /// Get an integer operand into a named register, loading constants
    /// through `li` and leaving register operands where they are.
    fn int_operand(&mut self, v: VReg, scratch: &'static str) -> CodegenResult<&'static str> {
        if self.is_const(v) {
            writeln!(self.out, "\tli\t{}, {}", scratch, self.cval(v))?;
            Ok(scratch)
        } else {
            Ok(r(self.phys(v)))
        }
    }

    fn is_asm_only(&self) -> bool {
        fn only_asm(stmt: &Stmt) -> bool {
            match stmt {
                Stmt::Empty | Stmt::Asm { .. } => true,
                Stmt::Block { stmts, .. } => stmts.iter().all(only_asm),
                _ => false,
            }
        }
        match &self.func.body {
            Some(body) => only_asm(body),
            None => true,
        }
    }

    fn function_returns(&self) -> bool {
        let bbcon = &self.fnbe.bbcon;
        match bbcon.order.last() {
            Some(&last) => bbcon.blocks[last]
                .insts
                .last()
                .map_or(true, |inst| !inst.is_terminator()),
            None => true,
        }
    }

    fn adjust_sp(&mut self, amount: i64) -> CodegenResult<()> {
        if amount == 0 {
            return Ok(());
        }
        if (-2048..=2047).contains(&amount) {
            writeln!(self.out, "\taddi\tsp, sp, {}", amount)?;
        } else {
            writeln!(self.out, "\tli\tt0, {}", amount)?;
            writeln!(self.out, "\tadd\tsp, sp, t0")?;
        }
        Ok(())
    }

    fn emit(&mut self) -> CodegenResult<()> {
        let global = !self.func.storage.contains(Storage::STATIC);
        let name = self.func.name.clone();

        writeln!(self.out)?;
        writeln!(self.out, "\t.text")?;
        if global {
            writeln!(self.out, "\t.globl\t{}", name)?;
        } else {
            writeln!(self.out, "\t.local\t{}", name)?;
        }
        writeln!(self.out, "\t.type\t{},@function", name)?;
        writeln!(self.out, "\t.align\t2")?;
        writeln!(self.out, "{}:", name)?;

        let no_stmt = self.is_asm_only();
        let used = self.ra().used_reg_bits & CALLEE_SAVED;
        let fused = self.ra().used_freg_bits & CALLEE_SAVED_F;
        let mut saves: Vec<String> = Vec::new();
        let mut total: i64 = 0;
        let mut save_base: i64 = 0;
        if !no_stmt {
            for p in 0..INT_REG_COUNT as PhysReg {
                if used & (1 << p) != 0 {
                    saves.push(r(p).to_string());
                }
            }
            for p in 0..FLOAT_REG_COUNT as PhysReg {
                if fused & (1 << p) != 0 {
                    saves.push(f(p).to_string());
                }
            }

            // Frame picture, from the frame pointer down: locals (at
            // negative s0 offsets), then ra/s0 and the callee saves, then
            // the outgoing-argument area at the stack pointer.
            save_base = self.fnbe.stack_work_size;
            let save_area = 16 + saves.len() as i64 * 8;
            total = self.fnbe.frame_size + save_area + self.fnbe.stack_work_size;
            total = (total + 15) & !15;

            self.adjust_sp(-total)?;
            writeln!(self.out, "\tsd\tra, {}(sp)", save_base + save_area - 8)?;
            writeln!(self.out, "\tsd\ts0, {}(sp)", save_base + save_area - 16)?;
            for (i, reg) in saves.clone().iter().enumerate() {
                let offset = save_base + 8 * i as i64;
                if reg.starts_with('f') {
                    writeln!(self.out, "\tfsd\t{}, {}(sp)", reg, offset)?;
                } else {
                    writeln!(self.out, "\tsd\t{}, {}(sp)", reg, offset)?;
                }
            }
            if total <= 2047 {
                writeln!(self.out, "\taddi\ts0, sp, {}", total)?;
            } else {
                writeln!(self.out, "\tli\tt0, {}", total)?;
                writeln!(self.out, "\tadd\ts0, sp, t0")?;
            }

            self.move_params_to_assigned()?;
        }

        let order = self.fnbe.bbcon.order.clone();
        for &bb in &order {
            writeln!(self.out, "{}:", self.fnbe.bbcon.blocks[bb].label)?;
            for idx in 0..self.fnbe.bbcon.blocks[bb].insts.len() {
                let inst = self.fnbe.bbcon.blocks[bb].insts[idx].clone();
                self.emit_inst(&inst, bb)?;
            }
        }

        if self.function_returns() {
            if !no_stmt {
                let save_area = 16 + saves.len() as i64 * 8;
                for (i, reg) in saves.clone().iter().enumerate().rev() {
                    let offset = save_base + 8 * i as i64;
                    if reg.starts_with('f') {
                        writeln!(self.out, "\tfld\t{}, {}(sp)", reg, offset)?;
                    } else {
                        writeln!(self.out, "\tld\t{}, {}(sp)", reg, offset)?;
                    }
                }
                writeln!(self.out, "\tld\ts0, {}(sp)", save_base + save_area - 16)?;
                writeln!(self.out, "\tld\tra, {}(sp)", save_base + save_area - 8)?;
                self.adjust_sp(total)?;
            }
            writeln!(self.out, "\tret")?;
        }
        Ok(())
    }

    fn move_params_to_assigned(&mut self) -> CodegenResult<()> {
        let params = self.fnbe.reg_params.clone();
        for p in &params {
            let (src, store, mv): (String, &str, &str) = if p.flonum {
                (
                    f(p.index).to_string(),
                    if p.size == VRegSize::B32 { "fsw" } else { "fsd" },
                    "fmv.d",
                )
            } else {
                (r(ARG_REGS[p.index as usize]).to_string(), "sd", "mv")
            };
            match &p.dest {
                crate::ir::ParamDest::Frame(fi) => {
                    let offset = fi.offset();
                    debug_assert!(offset != 0);
                    writeln!(self.out, "\t{}\t{}, {}(s0)", store, src, offset)?;
                }
                crate::ir::ParamDest::Reg(vreg) => {
                    let data = self.ra().vregs[*vreg].clone();
                    if data.flags.contains(VRegFlags::SPILLED) {
                        writeln!(self.out, "\t{}\t{}, {}(s0)", store, src, data.offset)?;
                    } else if let Some(phys) = data.phys {
                        let dst = if p.flonum { f(phys) } else { r(phys) };
                        if dst != src {
                            writeln!(self.out, "\t{}\t{}, {}", mv, dst, src)?;
                        }
                    }
                }
            }
        }

        if self.func.ty.vaargs {
            for i in self.fnbe.ireg_param_count..MAX_REG_ARGS {
                let offset = (i as i64 - MAX_REG_ARGS as i64) * 8;
                writeln!(self.out, "\tsd\t{}, {}(s0)", r(ARG_REGS[i]), offset)?;
            }
        }
        Ok(())
    }

    fn load_op(&self, v: VReg) -> &'static str {
        let unsigned = self.ra().vregs[v].flags.contains(VRegFlags::UNSIGNED);
        match (self.size(v), unsigned) {
            (VRegSize::B8, false) => "lb",
            (VRegSize::B8, true) => "lbu",
            (VRegSize::B16, false) => "lh",
            (VRegSize::B16, true) => "lhu",
            (VRegSize::B32, false) => "lw",
            (VRegSize::B32, true) => "lwu",
            (VRegSize::B64, _) => "ld",
        }
    }

    fn store_op(size: VRegSize) -> &'static str {
        match size {
            VRegSize::B8 => "sb",
            VRegSize::B16 => "sh",
            VRegSize::B32 => "sw",
            VRegSize::B64 => "sd",
        }
    }

    fn fsuffix(size: VRegSize) -> &'static str {
        if size == VRegSize::B32 {
            "s"
        } else {
            "d"
        }
    }

    fn branch_op(cc: CondCode) -> &'static str {
        match (cc.kind, cc.unsigned) {
            (CondKind::Eq, _) => "beq",
            (CondKind::Ne, _) => "bne",
            (CondKind::Lt, false) => "blt",
            (CondKind::Ge, false) => "bge",
            (CondKind::Lt, true) => "bltu",
            (CondKind::Ge, true) => "bgeu",
            // le/gt are swapped-operand forms of ge/lt.
            (CondKind::Le, false) => "bge",
            (CondKind::Gt, false) => "blt",
            (CondKind::Le, true) => "bgeu",
            (CondKind::Gt, true) => "bltu",
            (CondKind::Any, _) | (CondKind::None, _) => "j",
        }
    }

    fn emit_inst(&mut self, inst: &Inst, bb: Block) -> CodegenResult<()> {
        match inst {
            Inst::FrameAddr { dst, frame, offset } => {
                let total = frame.offset() as i64 + offset;
                let d = r(self.phys(*dst));
                if (-2048..=2047).contains(&total) {
                    writeln!(self.out, "\taddi\t{}, s0, {}", d, total)?;
                } else {
                    writeln!(self.out, "\tli\t{}, {}", d, total)?;
                    writeln!(self.out, "\tadd\t{}, s0, {}", d, d)?;
                }
            }
            Inst::LabelAddr { dst, label, offset } => {
                let d = r(self.phys(*dst));
                writeln!(self.out, "\tla\t{}, {}", d, label)?;
                if *offset != 0 {
                    writeln!(self.out, "\taddi\t{}, {}, {}", d, d, offset)?;
                }
            }
            Inst::StackAddr { dst, offset } => {
                let d = r(self.phys(*dst));
                let off = self.cval(*offset);
                if (-2048..=2047).contains(&off) {
                    writeln!(self.out, "\taddi\t{}, sp, {}", d, off)?;
                } else {
                    writeln!(self.out, "\tli\t{}, {}", d, off)?;
                    writeln!(self.out, "\tadd\t{}, sp, {}", d, d)?;
                }
            }
            Inst::Load { dst, addr } => {
                let a = r(self.phys(*addr));
                if self.is_flo(*dst) {
                    let op = if self.size(*dst) == VRegSize::B32 { "flw" } else { "fld" };
                    writeln!(self.out, "\t{}\t{}, 0({})", op, f(self.phys(*dst)), a)?;
                } else {
                    writeln!(self.out, "\t{}\t{}, 0({})", self.load_op(*dst), r(self.phys(*dst)), a)?;
                }
            }
            Inst::LoadSpill { dst, src } => {
                let offset = self.ra().vregs[*src].offset;
                if self.is_flo(*dst) {
                    let op = if self.size(*dst) == VRegSize::B32 { "flw" } else { "fld" };
                    writeln!(self.out, "\t{}\t{}, {}(s0)", op, f(self.phys(*dst)), offset)?;
                } else {
                    writeln!(self.out, "\t{}\t{}, {}(s0)", self.load_op(*dst), r(self.phys(*dst)), offset)?;
                }
            }
            Inst::Store { addr, src } => {
                let a = r(self.phys(*addr));
                if self.is_flo(*src) {
                    let op = if self.size(*src) == VRegSize::B32 { "fsw" } else { "fsd" };
                    writeln!(self.out, "\t{}\t{}, 0({})", op, f(self.phys(*src)), a)?;
                } else {
                    let s = self.int_operand(*src, "t0")?;
                    writeln!(self.out, "\t{}\t{}, 0({})", Self::store_op(self.size(*src)), s, a)?;
                }
            }
            Inst::StoreSpill { dst, src } => {
                let offset = self.ra().vregs[*dst].offset;
                if self.is_flo(*src) {
                    let op = if self.size(*src) == VRegSize::B32 { "fsw" } else { "fsd" };
                    writeln!(self.out, "\t{}\t{}, {}(s0)", op, f(self.phys(*src)), offset)?;
                } else {
                    writeln!(
                        self.out,
                        "\t{}\t{}, {}(s0)",
                        Self::store_op(self.size(*src)),
                        r(self.phys(*src)),
                        offset
                    )?;
                }
            }
            Inst::Binary { op, dst, lhs, rhs, flags } => {
                self.emit_binary(*op, *dst, *lhs, *rhs, *flags)?;
            }
            Inst::Unary { op, dst, src } => {
                if self.is_flo(*dst) {
                    debug_assert!(matches!(op, UnaryOp::Neg));
                    let sfx = Self::fsuffix(self.size(*dst));
                    writeln!(self.out, "\tfneg.{}\t{}, {}", sfx, f(self.phys(*dst)), f(self.phys(*src)))?;
                } else {
                    let s = self.int_operand(*src, "t0")?;
                    let d = r(self.phys(*dst));
                    match op {
                        UnaryOp::Neg => writeln!(self.out, "\tneg\t{}, {}", d, s)?,
                        UnaryOp::BitNot => writeln!(self.out, "\tnot\t{}, {}", d, s)?,
                    }
                }
            }
            Inst::SetCond { cc, dst, lhs, rhs } => self.emit_setcond(*cc, *dst, *lhs, *rhs)?,
            Inst::Branch { cc, lhs, rhs, dest } => {
                let label = self.fnbe.bbcon.blocks[*dest].label.clone();
                if cc.kind == CondKind::Any {
                    if self.fnbe.bbcon.next_of(bb) != Some(*dest) {
                        writeln!(self.out, "\tj\t{}", label)?;
                    }
                } else if let (Some(l), Some(r_)) = (lhs, rhs) {
                    if self.is_flo(*l) {
                        self.emit_float_compare(*cc, *l, *r_, "t0")?;
                        writeln!(self.out, "\tbnez\tt0, {}", label)?;
                    } else {
                        let mut cc = *cc;
                        let (mut a, mut b) = (*l, *r_);
                        if matches!(cc.kind, CondKind::Le | CondKind::Gt) {
                            // ble/bgt are assembler pseudo-ops; use the
                            // swapped real instructions instead.
                            std::mem::swap(&mut a, &mut b);
                            cc = cc.swap_args();
                        }
                        let ra_ = self.int_operand(a, "t0")?;
                        let rb = self.int_operand(b, "t1")?;
                        writeln!(self.out, "\t{}\t{}, {}, {}", Self::branch_op(cc), ra_, rb, label)?;
                    }
                }
            }
            Inst::BranchTable { index, targets } => {
                let table = self.local_label("tab");
                let idx = r(self.phys(*index));
                writeln!(self.out, "\tslli\tt5, {}, 3", idx)?;
                writeln!(self.out, "\tla\tt6, {}", table)?;
                writeln!(self.out, "\tadd\tt6, t6, t5")?;
                writeln!(self.out, "\tld\tt6, 0(t6)")?;
                writeln!(self.out, "\tjr\tt6")?;
                writeln!(self.out, "\t.section\t.rodata")?;
                writeln!(self.out, "\t.align\t3")?;
                writeln!(self.out, "{}:", table)?;
                for &t in targets {
                    writeln!(self.out, "\t.quad\t{}", self.fnbe.bbcon.blocks[t].label)?;
                }
                writeln!(self.out, "\t.text")?;
            }
            Inst::PreCall { .. } => {}
            Inst::PushArg { index, src } => {
                if self.is_flo(*src) {
                    if self.phys(*src) != *index as PhysReg {
                        let sfx = Self::fsuffix(self.size(*src));
                        writeln!(self.out, "\tfmv.{}\t{}, {}", sfx, f(*index as PhysReg), f(self.phys(*src)))?;
                    }
                } else if self.is_const(*src) {
                    writeln!(self.out, "\tli\t{}, {}", r(ARG_REGS[*index]), self.cval(*src))?;
                } else if self.phys(*src) != ARG_REGS[*index] {
                    writeln!(self.out, "\tmv\t{}, {}", r(ARG_REGS[*index]), r(self.phys(*src)))?;
                }
            }
            Inst::Call { dst, target, .. } => {
                match target {
                    CallTarget::Label(label) => writeln!(self.out, "\tcall\t{}", label)?,
                    CallTarget::Reg(v) => writeln!(self.out, "\tjalr\t{}", r(self.phys(*v)))?,
                }
                if let Some(d) = dst {
                    if self.is_flo(*d) {
                        if self.phys(*d) != 0 {
                            let sfx = Self::fsuffix(self.size(*d));
                            writeln!(self.out, "\tfmv.{}\t{}, fa0", sfx, f(self.phys(*d)))?;
                        }
                    } else if self.phys(*d) != 0 {
                        writeln!(self.out, "\tmv\t{}, a0", r(self.phys(*d)))?;
                    }
                }
            }
            Inst::Result { dst, src } => match dst {
                Some(d) => self.emit_inst(&Inst::Mov { dst: *d, src: *src }, bb)?,
                None => {
                    if self.is_flo(*src) {
                        if self.phys(*src) != 0 {
                            let sfx = Self::fsuffix(self.size(*src));
                            writeln!(self.out, "\tfmv.{}\tfa0, {}", sfx, f(self.phys(*src)))?;
                        }
                    } else if self.is_const(*src) {
                        writeln!(self.out, "\tli\ta0, {}", self.cval(*src))?;
                    } else if self.phys(*src) != 0 {
                        writeln!(self.out, "\tmv\ta0, {}", r(self.phys(*src)))?;
                    }
                }
            },
            Inst::SubSp { amount } => {
                let a = self.int_operand(*amount, "t0")?;
                writeln!(self.out, "\tsub\tsp, sp, {}", a)?;
            }
            Inst::Cast { dst, src, flags } => self.emit_cast(*dst, *src, *flags)?,
            Inst::Mov { dst, src } => {
                if self.is_flo(*dst) {
                    if self.is_const(*src) {
                        // Materialize the bit pattern through an integer
                        // register; RV64 has fmv.w.x/fmv.d.x for this.
                        writeln!(self.out, "\tli\tt0, {}", self.cval(*src))?;
                        let op = if self.size(*dst) == VRegSize::B32 { "fmv.w.x" } else { "fmv.d.x" };
                        writeln!(self.out, "\t{}\t{}, t0", op, f(self.phys(*dst)))?;
                    } else if self.phys(*src) != self.phys(*dst) {
                        let sfx = Self::fsuffix(self.size(*dst));
                        writeln!(self.out, "\tfmv.{}\t{}, {}", sfx, f(self.phys(*dst)), f(self.phys(*src)))?;
                    }
                } else if self.is_const(*src) {
                    writeln!(self.out, "\tli\t{}, {}", r(self.phys(*dst)), self.cval(*src))?;
                } else if self.phys(*src) != self.phys(*dst) {
                    writeln!(self.out, "\tmv\t{}, {}", r(self.phys(*dst)), r(self.phys(*src)))?;
                }
            }
            Inst::Keep { .. } => {}
            Inst::Phi { .. } => panic!("phi survived to emission"),
            Inst::Asm { text } => writeln!(self.out, "\t{}", text)?,
        }
        Ok(())
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        dst: VReg,
        lhs: VReg,
        rhs: VReg,
        flags: IrFlags,
    ) -> CodegenResult<()> {
        if self.is_flo(dst) {
            let sfx = Self::fsuffix(self.size(dst));
            let mnemonic = match op {
                BinaryOp::Add => "fadd",
                BinaryOp::Sub => "fsub",
                BinaryOp::Mul => "fmul",
                BinaryOp::Div => "fdiv",
                _ => panic!("float {:?} has no machine form", op),
            };
            writeln!(
                self.out,
                "\t{}.{}\t{}, {}, {}",
                mnemonic,
                sfx,
                f(self.phys(dst)),
                f(self.phys(lhs)),
                f(self.phys(rhs))
            )?;
            return Ok(());
        }

        let unsigned = flags.contains(IrFlags::UNSIGNED);
        // 32-bit operations use the word forms so results stay properly
        // sign-extended in the 64-bit registers.
        let w = if self.size(dst) <= VRegSize::B32 { "w" } else { "" };
        let mnemonic: String = match op {
            BinaryOp::Add => format!("add{}", w),
            BinaryOp::Sub => format!("sub{}", w),
            BinaryOp::Mul => format!("mul{}", w),
            BinaryOp::Div if unsigned => format!("divu{}", w),
            BinaryOp::Div => format!("div{}", w),
            BinaryOp::Mod if unsigned => format!("remu{}", w),
            BinaryOp::Mod => format!("rem{}", w),
            BinaryOp::BitAnd => "and".to_string(),
            BinaryOp::BitOr => "or".to_string(),
            BinaryOp::BitXor => "xor".to_string(),
            BinaryOp::LShift => format!("sll{}", w),
            BinaryOp::RShift if unsigned => format!("srl{}", w),
            BinaryOp::RShift => format!("sra{}", w),
        };
        let a = self.int_operand(lhs, "t0")?;
        let b = self.int_operand(rhs, "t1")?;
        writeln!(self.out, "\t{}\t{}, {}, {}", mnemonic, r(self.phys(dst)), a, b)?;
        Ok(())
    }

    fn emit_float_compare(
        &mut self,
        cc: CondCode,
        lhs: VReg,
        rhs: VReg,
        dst: &str,
    ) -> CodegenResult<()> {
        let sfx = Self::fsuffix(self.size(lhs));
        let (op, a, b, negate) = match cc.kind {
            CondKind::Eq => ("feq", lhs, rhs, false),
            CondKind::Ne => ("feq", lhs, rhs, true),
            CondKind::Lt => ("flt", lhs, rhs, false),
            CondKind::Le => ("fle", lhs, rhs, false),
            CondKind::Gt => ("flt", rhs, lhs, false),
            CondKind::Ge => ("fle", rhs, lhs, false),
            _ => panic!("not a comparison"),
        };
        writeln!(
            self.out,
            "\t{}.{}\t{}, {}, {}",
            op,
            sfx,
            dst,
            f(self.phys(a)),
            f(self.phys(b))
        )?;
        if negate {
            writeln!(self.out, "\txori\t{}, {}, 1", dst, dst)?;
        }
        Ok(())
    }

    fn emit_setcond(&mut self, cc: CondCode, dst: VReg, lhs: VReg, rhs: VReg) -> CodegenResult<()> {
        if self.is_flo(lhs) {
            let d = r(self.phys(dst));
            return self.emit_float_compare(cc, lhs, rhs, d);
        }
        let d = r(self.phys(dst));
        let a = self.int_operand(lhs, "t0")?;
        let b = self.int_operand(rhs, "t1")?;
        let slt = if cc.unsigned { "sltu" } else { "slt" };
        match cc.kind {
            CondKind::Eq => {
                writeln!(self.out, "\txor\t{}, {}, {}", d, a, b)?;
                writeln!(self.out, "\tseqz\t{}, {}", d, d)?;
            }
            CondKind::Ne => {
                writeln!(self.out, "\txor\t{}, {}, {}", d, a, b)?;
                writeln!(self.out, "\tsnez\t{}, {}", d, d)?;
            }
            CondKind::Lt => writeln!(self.out, "\t{}\t{}, {}, {}", slt, d, a, b)?,
            CondKind::Gt => writeln!(self.out, "\t{}\t{}, {}, {}", slt, d, b, a)?,
            CondKind::Ge => {
                writeln!(self.out, "\t{}\t{}, {}, {}", slt, d, a, b)?;
                writeln!(self.out, "\txori\t{}, {}, 1", d, d)?;
            }
            CondKind::Le => {
                writeln!(self.out, "\t{}\t{}, {}, {}", slt, d, b, a)?;
                writeln!(self.out, "\txori\t{}, {}, 1", d, d)?;
            }
            CondKind::Any | CondKind::None => panic!("not a comparison"),
        }
        Ok(())
    }

    fn emit_cast(&mut self, dst: VReg, src: VReg, flags: IrFlags) -> CodegenResult<()> {
        let unsigned = flags.contains(IrFlags::UNSIGNED);
        match (self.is_flo(src), self.is_flo(dst)) {
            (false, false) => {
                let d = r(self.phys(dst));
                let s = self.int_operand(src, "t0")?;
                let (ssize, dsize) = (self.size(src), self.size(dst));
                if dsize <= ssize {
                    match dsize {
                        VRegSize::B8 => writeln!(self.out, "\tandi\t{}, {}, 0xff", d, s)?,
                        VRegSize::B16 => {
                            writeln!(self.out, "\tslli\t{}, {}, 48", d, s)?;
                            writeln!(self.out, "\tsrli\t{}, {}, 48", d, d)?;
                        }
                        VRegSize::B32 => writeln!(self.out, "\tsext.w\t{}, {}", d, s)?,
                        VRegSize::B64 => {
                            if d != s {
                                writeln!(self.out, "\tmv\t{}, {}", d, s)?;
                            }
                        }
                    }
                } else {
                    match (ssize, unsigned) {
                        (VRegSize::B8, true) => writeln!(self.out, "\tandi\t{}, {}, 0xff", d, s)?,
                        (VRegSize::B8, false) => {
                            writeln!(self.out, "\tslli\t{}, {}, 56", d, s)?;
                            writeln!(self.out, "\tsrai\t{}, {}, 56", d, d)?;
                        }
                        (VRegSize::B16, true) => {
                            writeln!(self.out, "\tslli\t{}, {}, 48", d, s)?;
                            writeln!(self.out, "\tsrli\t{}, {}, 48", d, d)?;
                        }
                        (VRegSize::B16, false) => {
                            writeln!(self.out, "\tslli\t{}, {}, 48", d, s)?;
                            writeln!(self.out, "\tsrai\t{}, {}, 48", d, d)?;
                        }
                        (VRegSize::B32, true) => {
                            writeln!(self.out, "\tslli\t{}, {}, 32", d, s)?;
                            writeln!(self.out, "\tsrli\t{}, {}, 32", d, d)?;
                        }
                        (VRegSize::B32, false) => writeln!(self.out, "\tsext.w\t{}, {}", d, s)?,
                        (VRegSize::B64, _) => {
                            if d != s {
                                writeln!(self.out, "\tmv\t{}, {}", d, s)?;
                            }
                        }
                    }
                }
            }
            (false, true) => {
                let fsfx = Self::fsuffix(self.size(dst));
                let isfx = if self.size(src) == VRegSize::B64 { "l" } else { "w" };
                let u = if unsigned { "u" } else { "" };
                let s = self.int_operand(src, "t0")?;
                writeln!(
                    self.out,
                    "\tfcvt.{}.{}{}\t{}, {}",
                    fsfx,
                    isfx,
                    u,
                    f(self.phys(dst)),
                    s
                )?;
            }
            (true, false) => {
                let fsfx = Self::fsuffix(self.size(src));
                let isfx = if self.size(dst) == VRegSize::B64 { "l" } else { "w" };
                writeln!(
                    self.out,
                    "\tfcvt.{}.{}\t{}, {}, rtz",
                    isfx,
                    fsfx,
                    r(self.phys(dst)),
                    f(self.phys(src))
                )?;
            }
            (true, true) => {
                if self.size(src) != self.size(dst) {
                    let (to, from) = (Self::fsuffix(self.size(dst)), Self::fsuffix(self.size(src)));
                    writeln!(
                        self.out,
                        "\tfcvt.{}.{}\t{}, {}",
                        to,
                        from,
                        f(self.phys(dst)),
                        f(self.phys(src))
                    )?;
                } else if self.phys(src) != self.phys(dst) {
                    let sfx = Self::fsuffix(self.size(dst));
                    writeln!(self.out, "\tfmv.{}\t{}, {}", sfx, f(self.phys(dst)), f(self.phys(src)))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_numbering() {
        assert_eq!(r(0), "a0");
        assert_eq!(r(8), "s1");
        assert_eq!(r(INT_REG_COUNT as PhysReg), "t5");
        assert_eq!(f(0), "fa0");
        assert_eq!(CALLEE_SAVED & CALLER_SAVED, 0);
    }
}
