//! The x86-64 backend: System V AMD64 calling convention, AT&T syntax.
//!
//! Physical register numbering puts the twelve allocatable integer
//! registers first (caller-saved before callee-saved, so cheap functions
//! avoid prologue pushes) and reserves `r10`/`r11` as spill scratch outside
//! the allocatable range. Machine idioms with fixed registers are expressed
//! as occupied masks: `rax:rdx` around division, `cl` for variable shift
//! counts, the argument registers across a call sequence.

use std::io::Write;

use log::trace;

use crate::ir::{
    BinaryOp, Block, CallTarget, CondCode, CondKind, FuncBackend, Inst, IrFlags, PhysReg,
    RegBits, UnaryOp, VReg, VRegFlags, VRegSize,
};
use crate::isa::TargetIsa;
use crate::regalloc::{RegAlloc, RegAllocFlags};
use crate::CodegenResult;
use chert_ast::{Function, GlobalVar, Initializer, Stmt, Storage};

const INT_REG_COUNT: usize = 12;
const FLOAT_REG_COUNT: usize = 14;
const MAX_REG_ARGS: usize = 6;
const MAX_FREG_ARGS: usize = 8;

// Allocatable order: rax rcx rdx rsi rdi r8 r9 rbx r12 r13 r14 r15,
// then the two scratches r10 r11.
static REG8: [&str; 14] = [
    "al", "cl", "dl", "sil", "dil", "r8b", "r9b", "bl", "r12b", "r13b", "r14b", "r15b", "r10b",
    "r11b",
];
static REG16: [&str; 14] = [
    "ax", "cx", "dx", "si", "di", "r8w", "r9w", "bx", "r12w", "r13w", "r14w", "r15w", "r10w",
    "r11w",
];
static REG32: [&str; 14] = [
    "eax", "ecx", "edx", "esi", "edi", "r8d", "r9d", "ebx", "r12d", "r13d", "r14d", "r15d",
    "r10d", "r11d",
];
static REG64: [&str; 14] = [
    "rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "rbx", "r12", "r13", "r14", "r15", "r10",
    "r11",
];

const RAX: PhysReg = 0;
const RCX: PhysReg = 1;
const RDX: PhysReg = 2;
const INT_SCRATCH0: PhysReg = 12; // r10
const INT_SCRATCH1: PhysReg = 13; // r11
const FLOAT_SCRATCH0: PhysReg = 14; // xmm14

/// Integer argument registers: rdi, rsi, rdx, rcx, r8, r9.
static ARG_REGS: [PhysReg; MAX_REG_ARGS] = [4, 3, 2, 1, 5, 6];

/// rbx, r12..r15.
const CALLEE_SAVED: RegBits = 0b1111_1000_0000;
/// rax, rcx, rdx, rsi, rdi, r8, r9.
const CALLER_SAVED: RegBits = 0b0000_0111_1111;

fn rname(phys: PhysReg, size: VRegSize) -> &'static str {
    let table = match size {
        VRegSize::B8 => &REG8,
        VRegSize::B16 => &REG16,
        VRegSize::B32 => &REG32,
        VRegSize::B64 => &REG64,
    };
    table[phys as usize]
}

fn fname(phys: PhysReg) -> String {
    format!("xmm{}", phys)
}

/// The x86-64 code generator.
pub struct X64Backend(());

impl X64Backend {
    /// Create the backend.
    pub fn new() -> X64Backend {
        X64Backend(())
    }
}

impl TargetIsa for X64Backend {
    fn name(&self) -> &'static str {
        "x64"
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
        0
    }

    fn call_clobber_mask(&self) -> RegBits {
        CALLER_SAVED
    }

    fn call_clobber_fmask(&self) -> RegBits {
        (1 << FLOAT_REG_COUNT) - 1
    }

    fn inst_occupied_mask(&self, inst: &Inst, ra: &RegAlloc) -> RegBits {
        match inst {
            Inst::Binary { op, rhs, .. } => match op {
                // The division pair lives in rax:rdx.
                BinaryOp::Div | BinaryOp::Mod => (1 << RAX) | (1 << RDX),
                // A variable shift count must end up in cl.
                BinaryOp::LShift | BinaryOp::RShift if !ra.vregs[*rhs].is_const() => 1 << RCX,
                _ => 0,
            },
            Inst::PushArg { index, src } if !ra.vregs[*src].is_flonum() => ARG_REGS
                .get(*index)
                .map(|&p| 1 << p)
                .unwrap_or(0),
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
        // Return address and the saved frame pointer sit in between.
        16
    }

    fn vaarg_save_area_size(&self) -> usize {
        (MAX_REG_ARGS + MAX_FREG_ARGS) * 8
    }

    fn vaarg_start_offset(&self, ireg_params: usize) -> i32 {
        ((ireg_params as i32) - (MAX_REG_ARGS + MAX_FREG_ARGS) as i32) * 8
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
            lconsts: Vec::new(),
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
        writeln!(out, "\t.align\t{}", align)?;
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
                2 => ".word",
                4 => ".long",
                _ => ".quad",
            };
            writeln!(out, "\t{}\t{}", directive, v)?;
        }
        Initializer::Flonum(v) => {
            if ty.size(8) == 4 {
                writeln!(out, "\t.long\t0x{:08x}", (*v as f32).to_bits())?;
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
            // The front end supplies one entry per element in layout order.
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

/// Kinds of literal-pool constants a function can need.
enum PoolConst {
    F32(u32),
    F64(u64),
    /// Sign-bit mask for floating point negation.
    SignMask(bool),
}

struct FuncEmitter<'a> {
    out: &'a mut dyn Write,
    func: &'a Function,
    fnbe: &'a mut FuncBackend,
    lconsts: Vec<(String, PoolConst)>,
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

    fn size(&self, v: VReg) -> VRegSize {
        self.ra().vregs[v].size
    }

    fn is_flo(&self, v: VReg) -> bool {
        self.ra().vregs[v].is_flonum()
    }

    fn reg(&self, v: VReg) -> String {
        if self.is_flo(v) {
            format!("%{}", fname(self.phys(v)))
        } else {
            format!("%{}", rname(self.phys(v), self.size(v)))
        }
    }

    fn reg_sized(&self, v: VReg, size: VRegSize) -> String {
        format!("%{}", rname(self.phys(v), size))
    }

    fn local_label(&mut self, tag: &str) -> String {
        let n = self.next_local;
        self.next_local += 1;
        format!(".L{}_{}{}", self.func.name, tag, n)
    }

    fn pool_label(&mut self, c: PoolConst) -> String {
        let label = self.local_label("C");
        self.lconsts.push((label.clone(), c));
        label
    }

    fn mov_suffix(size: VRegSize) -> &'static str {
        match size {
            VRegSize::B8 => "movb",
            VRegSize::B16 => "movw",
            VRegSize::B32 => "movl",
            VRegSize::B64 => "movq",
        }
    }

    fn fmov(size: VRegSize) -> &'static str {
        if size == VRegSize::B32 {
            "movss"
        } else {
            "movsd"
        }
    }

    fn cond_suffix(cc: CondCode) -> &'static str {
        match (cc.kind, cc.unsigned) {
            (CondKind::Eq, _) => "e",
            (CondKind::Ne, _) => "ne",
            (CondKind::Lt, false) => "l",
            (CondKind::Le, false) => "le",
            (CondKind::Ge, false) => "ge",
            (CondKind::Gt, false) => "g",
            (CondKind::Lt, true) => "b",
            (CondKind::Le, true) => "be",
            (CondKind::Ge, true) => "ae",
            (CondKind::Gt, true) => "a",
            (CondKind::Any, _) | (CondKind::None, _) => "mp",
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

    /// All return paths gone (infinite loops): the shared exit block got
    /// pruned and the body ends in a jump, so the epilogue would be dead.
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
        #[cfg(not(target_os = "macos"))]
        writeln!(self.out, "\t.type\t{},@function", name)?;
        writeln!(self.out, "\t.align\t4")?;
        writeln!(self.out, "{}:", name)?;

        let no_stmt = self.is_asm_only();

        // Prologue.
        let used = self.ra().used_reg_bits & CALLEE_SAVED;
        let mut callee_saved: Vec<PhysReg> = Vec::new();
        let mut frame_size: i64 = 0;
        let mut rbp_saved = false;
        if !no_stmt {
            for p in 0..INT_REG_COUNT as PhysReg {
                if used & (1 << p) != 0 {
                    writeln!(self.out, "\tpush\t%{}", rname(p, VRegSize::B64))?;
                    callee_saved.push(p);
                }
            }
            // Return address plus the saves already on the stack.
            let mut frame_offset = 8 + callee_saved.len() as i64 * 8;

            if self.fnbe.frame_size > 0
                || self.ra().flags.contains(RegAllocFlags::STACK_FRAME)
            {
                writeln!(self.out, "\tpush\t%rbp")?;
                writeln!(self.out, "\tmov\t%rsp, %rbp")?;
                rbp_saved = true;
                frame_offset += 8;
            }

            // Stack-passed parameters sit above the callee saves; their
            // frame offsets were provisionally based at +16 and can only
            // be finalized now that the save count is known.
            if !callee_saved.is_empty() {
                let bias = callee_saved.len() as i32 * 8;
                for fi in &self.fnbe.stack_params {
                    fi.set_offset(fi.offset() + bias);
                }
            }

            let stack_modified = self
                .func
                .flags
                .contains(chert_ast::FuncFlags::STACK_MODIFIED);
            if self.fnbe.funcall_count > 0 || stack_modified {
                let mut work = self.fnbe.stack_work_size;
                if stack_modified {
                    work = (work + 15) & !15;
                }
                frame_size = self.fnbe.frame_size + work;
                frame_size += -(frame_size + frame_offset) & 15;
            } else {
                frame_size = self.fnbe.frame_size + self.fnbe.stack_work_size;
            }
            if frame_size > 0 {
                writeln!(self.out, "\tsub\t${}, %rsp", frame_size)?;
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
                if rbp_saved {
                    writeln!(self.out, "\tmov\t%rbp, %rsp")?;
                    writeln!(self.out, "\tpop\t%rbp")?;
                } else if frame_size > 0 {
                    writeln!(self.out, "\tadd\t${}, %rsp", frame_size)?;
                }
                for &p in callee_saved.iter().rev() {
                    writeln!(self.out, "\tpop\t%{}", rname(p, VRegSize::B64))?;
                }
            }
            writeln!(self.out, "\tret")?;
        }

        self.flush_literal_pool()?;
        trace!("emitted {}", name);
        Ok(())
    }

    fn flush_literal_pool(&mut self) -> CodegenResult<()> {
        if self.lconsts.is_empty() {
            return Ok(());
        }
        writeln!(self.out, "\t.section\t.rodata")?;
        for (label, c) in std::mem::take(&mut self.lconsts) {
            match c {
                PoolConst::F32(bits) => {
                    writeln!(self.out, "\t.align\t4")?;
                    writeln!(self.out, "{}:", label)?;
                    writeln!(self.out, "\t.long\t0x{:08x}", bits)?;
                }
                PoolConst::F64(bits) => {
                    writeln!(self.out, "\t.align\t8")?;
                    writeln!(self.out, "{}:", label)?;
                    writeln!(self.out, "\t.quad\t0x{:016x}", bits)?;
                }
                PoolConst::SignMask(is64) => {
                    writeln!(self.out, "\t.align\t16")?;
                    writeln!(self.out, "{}:", label)?;
                    if is64 {
                        writeln!(self.out, "\t.quad\t0x8000000000000000, 0")?;
                    } else {
                        writeln!(self.out, "\t.long\t0x80000000, 0, 0, 0")?;
                    }
                }
            }
        }
        writeln!(self.out, "\t.text")?;
        Ok(())
    }

    /// Shuffle ABI argument registers into the registers (or frame slots)
    /// the allocator picked for the parameters.
    fn move_params_to_assigned(&mut self) -> CodegenResult<()> {
        let params = self.fnbe.reg_params.clone();
        for p in &params {
            let (src, mv) = if p.flonum {
                (format!("%{}", fname(p.index)), Self::fmov(p.size))
            } else {
                (format!("%{}", rname(ARG_REGS[p.index as usize], p.size)), "mov")
            };
            match &p.dest {
                crate::ir::ParamDest::Frame(fi) => {
                    let offset = fi.offset();
                    debug_assert!(offset != 0);
                    writeln!(self.out, "\t{}\t{}, {}(%rbp)", mv, src, offset)?;
                }
                crate::ir::ParamDest::Reg(vreg) => {
                    let data = self.ra().vregs[*vreg].clone();
                    if data.flags.contains(VRegFlags::SPILLED) {
                        debug_assert!(data.offset != 0);
                        writeln!(self.out, "\t{}\t{}, {}(%rbp)", mv, src, data.offset)?;
                    } else if let Some(phys) = data.phys {
                        let dst = if p.flonum {
                            format!("%{}", fname(phys))
                        } else {
                            format!("%{}", rname(phys, p.size))
                        };
                        if dst != src {
                            writeln!(self.out, "\t{}\t{}, {}", mv, src, dst)?;
                        }
                    }
                }
            }
        }

        // A variadic function banks the unused argument registers so
        // va_arg can walk them as memory.
        if self.func.ty.vaargs {
            for i in self.fnbe.ireg_param_count..MAX_REG_ARGS {
                let offset = (i as i64 - (MAX_REG_ARGS + MAX_FREG_ARGS) as i64) * 8;
                writeln!(
                    self.out,
                    "\tmov\t%{}, {}(%rbp)",
                    rname(ARG_REGS[i], VRegSize::B64),
                    offset
                )?;
            }
            for i in self.fnbe.freg_param_count..MAX_FREG_ARGS {
                let offset = (i as i64 - MAX_FREG_ARGS as i64) * 8;
                writeln!(self.out, "\tmovsd\t%xmm{}, {}(%rbp)", i, offset)?;
            }
        }
        Ok(())
    }

    /// Move an integer value (register or constant) into a physical
    /// register, sized by `size`.
    fn mov_into(&mut self, src: VReg, phys: PhysReg, size: VRegSize) -> CodegenResult<()> {
        if self.is_const(src) {
            let v = self.cval(src);
            if size == VRegSize::B64 && (v > i32::MAX as i64 || v < i32::MIN as i64) {
                writeln!(self.out, "\tmovabs\t${}, %{}", v, rname(phys, size))?;
            } else {
                writeln!(self.out, "\tmov\t${}, %{}", v, rname(phys, size))?;
            }
        } else if self.phys(src) != phys {
            writeln!(
                self.out,
                "\tmov\t{}, %{}",
                self.reg_sized(src, size),
                rname(phys, size)
            )?;
        }
        Ok(())
    }

    fn emit_compare(&mut self, lhs: VReg, rhs: VReg, cc: CondCode) -> CodegenResult<CondCode> {
        if self.is_flo(lhs) {
            let op = if self.size(lhs) == VRegSize::B32 {
                "comiss"
            } else {
                "comisd"
            };
            // comis* orders like unsigned integers.
            writeln!(self.out, "\t{}\t{}, {}", op, self.reg(rhs), self.reg(lhs))?;
            return Ok(CondCode {
                unsigned: true,
                ..cc
            });
        }
        let size = self.size(lhs).max(self.size(rhs));
        if self.is_const(rhs) {
            writeln!(
                self.out,
                "\tcmp\t${}, {}",
                self.cval(rhs),
                self.reg_sized(lhs, size)
            )?;
            Ok(cc)
        } else if self.is_const(lhs) {
            writeln!(
                self.out,
                "\tcmp\t${}, {}",
                self.cval(lhs),
                self.reg_sized(rhs, size)
            )?;
            Ok(cc.swap_args())
        } else {
            writeln!(
                self.out,
                "\tcmp\t{}, {}",
                self.reg_sized(rhs, size),
                self.reg_sized(lhs, size)
            )?;
            Ok(cc)
        }
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
            return self.emit_float_binary(op, dst, lhs, rhs);
        }
        let unsigned = flags.contains(IrFlags::UNSIGNED);
        let size = self.size(dst);
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::BitAnd | BinaryOp::BitOr
            | BinaryOp::BitXor | BinaryOp::Mul => {
                let mnemonic = match op {
                    BinaryOp::Add => "add",
                    BinaryOp::Sub => "sub",
                    BinaryOp::BitAnd => "and",
                    BinaryOp::BitOr => "or",
                    BinaryOp::BitXor => "xor",
                    BinaryOp::Mul => "imul",
                    _ => unreachable!(),
                };
                let commutative = !matches!(op, BinaryOp::Sub);
                let dphys = self.phys(dst);
                let operand = |e: &Self, v: VReg| -> String {
                    if e.is_const(v) {
                        format!("${}", e.cval(v))
                    } else {
                        e.reg_sized(v, size)
                    }
                };
                if !self.is_const(lhs) && self.phys(lhs) == dphys {
                    let o = operand(self, rhs);
                    writeln!(self.out, "\t{}\t{}, {}", mnemonic, o, self.reg_sized(dst, size))?;
                } else if commutative && !self.is_const(rhs) && self.phys(rhs) == dphys {
                    let o = operand(self, lhs);
                    writeln!(self.out, "\t{}\t{}, {}", mnemonic, o, self.reg_sized(dst, size))?;
                } else if op == BinaryOp::Sub && !self.is_const(rhs) && self.phys(rhs) == dphys {
                    // dst aliases the subtrahend: compute rhs-lhs, negate.
                    let o = operand(self, lhs);
                    writeln!(self.out, "\t{}\t{}, {}", mnemonic, o, self.reg_sized(dst, size))?;
                    writeln!(self.out, "\tneg\t{}", self.reg_sized(dst, size))?;
                } else {
                    self.mov_into(lhs, dphys, size)?;
                    let o = operand(self, rhs);
                    writeln!(self.out, "\t{}\t{}, {}", mnemonic, o, self.reg_sized(dst, size))?;
                }
            }
            BinaryOp::Div | BinaryOp::Mod => {
                // The divisor goes through a scratch so rax/rdx stay free
                // for the division pair.
                let size = if size < VRegSize::B32 { VRegSize::B32 } else { size };
                self.mov_into(rhs, INT_SCRATCH1, size)?;
                self.mov_into(lhs, RAX, size)?;
                if unsigned {
                    writeln!(self.out, "\txor\t%edx, %edx")?;
                    writeln!(self.out, "\tdiv\t%{}", rname(INT_SCRATCH1, size))?;
                } else {
                    if size == VRegSize::B64 {
                        writeln!(self.out, "\tcqto")?;
                    } else {
                        writeln!(self.out, "\tcltd")?;
                    }
                    writeln!(self.out, "\tidiv\t%{}", rname(INT_SCRATCH1, size))?;
                }
                let res = if op == BinaryOp::Div { RAX } else { RDX };
                let dphys = self.phys(dst);
                if dphys != res {
                    writeln!(
                        self.out,
                        "\tmov\t%{}, %{}",
                        rname(res, size),
                        rname(dphys, size)
                    )?;
                }
            }
            BinaryOp::LShift | BinaryOp::RShift => {
                let mnemonic = match (op, unsigned) {
                    (BinaryOp::LShift, _) => "shl",
                    (BinaryOp::RShift, true) => "shr",
                    (BinaryOp::RShift, false) => "sar",
                    _ => unreachable!(),
                };
                let dphys = self.phys(dst);
                if self.is_const(rhs) {
                    self.mov_into(lhs, dphys, size)?;
                    writeln!(
                        self.out,
                        "\t{}\t${}, {}",
                        mnemonic,
                        self.cval(rhs) & 63,
                        self.reg_sized(dst, size)
                    )?;
                } else if dphys == RCX {
                    // The count must sit in cl; route the value through a
                    // scratch when dst itself is rcx.
                    self.mov_into(lhs, INT_SCRATCH0, size)?;
                    self.mov_into(rhs, RCX, VRegSize::B32)?;
                    writeln!(self.out, "\t{}\t%cl, %{}", mnemonic, rname(INT_SCRATCH0, size))?;
                    writeln!(
                        self.out,
                        "\tmov\t%{}, {}",
                        rname(INT_SCRATCH0, size),
                        self.reg_sized(dst, size)
                    )?;
                } else {
                    self.mov_into(rhs, RCX, VRegSize::B32)?;
                    self.mov_into(lhs, dphys, size)?;
                    writeln!(self.out, "\t{}\t%cl, {}", mnemonic, self.reg_sized(dst, size))?;
                }
            }
        }
        Ok(())
    }

    fn emit_float_binary(
        &mut self,
        op: BinaryOp,
        dst: VReg,
        lhs: VReg,
        rhs: VReg,
    ) -> CodegenResult<()> {
        let size = self.size(dst);
        let suffix = if size == VRegSize::B32 { "ss" } else { "sd" };
        let mnemonic = match op {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            _ => panic!("float {:?} has no machine form", op),
        };
        let dphys = self.phys(dst);
        if self.phys(lhs) == dphys && self.phys(rhs) != dphys {
            writeln!(
                self.out,
                "\t{}{}\t{}, {}",
                mnemonic, suffix, self.reg(rhs), self.reg(dst)
            )?;
        } else {
            let scratch = fname(FLOAT_SCRATCH0);
            let mv = Self::fmov(size);
            writeln!(self.out, "\t{}\t{}, %{}", mv, self.reg(lhs), scratch)?;
            writeln!(self.out, "\t{}{}\t{}, %{}", mnemonic, suffix, self.reg(rhs), scratch)?;
            writeln!(self.out, "\t{}\t%{}, {}", mv, scratch, self.reg(dst))?;
        }
        Ok(())
    }

    fn emit_inst(&mut self, inst: &Inst, bb: Block) -> CodegenResult<()> {
        match inst {
            Inst::FrameAddr { dst, frame, offset } => {
                let total = frame.offset() as i64 + offset;
                writeln!(self.out, "\tlea\t{}(%rbp), {}", total, self.reg_sized(*dst, VRegSize::B64))?;
            }
            Inst::LabelAddr { dst, label, offset } => {
                if *offset == 0 {
                    writeln!(self.out, "\tlea\t{}(%rip), {}", label, self.reg_sized(*dst, VRegSize::B64))?;
                } else {
                    writeln!(
                        self.out,
                        "\tlea\t{}{:+}(%rip), {}",
                        label, offset, self.reg_sized(*dst, VRegSize::B64)
                    )?;
                }
            }
            Inst::StackAddr { dst, offset } => {
                writeln!(
                    self.out,
                    "\tlea\t{}(%rsp), {}",
                    self.cval(*offset),
                    self.reg_sized(*dst, VRegSize::B64)
                )?;
            }
            Inst::Load { dst, addr } => {
                let a = self.reg_sized(*addr, VRegSize::B64);
                if self.is_flo(*dst) {
                    writeln!(self.out, "\t{}\t({}), {}", Self::fmov(self.size(*dst)), a, self.reg(*dst))?;
                } else {
                    writeln!(self.out, "\tmov\t({}), {}", a, self.reg(*dst))?;
                }
            }
            Inst::LoadSpill { dst, src } => {
                let offset = self.ra().vregs[*src].offset;
                debug_assert!(offset != 0);
                if self.is_flo(*dst) {
                    writeln!(self.out, "\t{}\t{}(%rbp), {}", Self::fmov(self.size(*dst)), offset, self.reg(*dst))?;
                } else {
                    writeln!(self.out, "\tmov\t{}(%rbp), {}", offset, self.reg(*dst))?;
                }
            }
            Inst::Store { addr, src } => {
                let a = self.reg_sized(*addr, VRegSize::B64);
                if self.is_const(*src) {
                    writeln!(
                        self.out,
                        "\t{}\t${}, ({})",
                        Self::mov_suffix(self.size(*src)),
                        self.cval(*src),
                        a
                    )?;
                } else if self.is_flo(*src) {
                    writeln!(self.out, "\t{}\t{}, ({})", Self::fmov(self.size(*src)), self.reg(*src), a)?;
                } else {
                    writeln!(self.out, "\tmov\t{}, ({})", self.reg(*src), a)?;
                }
            }
            Inst::StoreSpill { dst, src } => {
                let offset = self.ra().vregs[*dst].offset;
                debug_assert!(offset != 0);
                if self.is_flo(*src) {
                    writeln!(self.out, "\t{}\t{}, {}(%rbp)", Self::fmov(self.size(*src)), self.reg(*src), offset)?;
                } else {
                    writeln!(self.out, "\tmov\t{}, {}(%rbp)", self.reg(*src), offset)?;
                }
            }
            Inst::Binary { op, dst, lhs, rhs, flags } => {
                self.emit_binary(*op, *dst, *lhs, *rhs, *flags)?;
            }
            Inst::Unary { op, dst, src } => {
                if self.is_flo(*dst) {
                    // Negation via sign-bit xor; complement has no float form.
                    debug_assert!(matches!(op, UnaryOp::Neg));
                    let is64 = self.size(*dst) != VRegSize::B32;
                    let label = self.pool_label(PoolConst::SignMask(is64));
                    let mv = Self::fmov(self.size(*dst));
                    if self.phys(*src) != self.phys(*dst) {
                        writeln!(self.out, "\t{}\t{}, {}", mv, self.reg(*src), self.reg(*dst))?;
                    }
                    let op = if is64 { "xorpd" } else { "xorps" };
                    writeln!(self.out, "\t{}\t{}(%rip), {}", op, label, self.reg(*dst))?;
                } else {
                    let size = self.size(*dst);
                    self.mov_into(*src, self.phys(*dst), size)?;
                    let mnemonic = match op {
                        UnaryOp::Neg => "neg",
                        UnaryOp::BitNot => "not",
                    };
                    writeln!(self.out, "\t{}\t{}", mnemonic, self.reg_sized(*dst, size))?;
                }
            }
            Inst::SetCond { cc, dst, lhs, rhs } => {
                let cc = self.emit_compare(*lhs, *rhs, *cc)?;
                let d8 = self.reg_sized(*dst, VRegSize::B8);
                writeln!(self.out, "\tset{}\t{}", Self::cond_suffix(cc), d8)?;
                writeln!(
                    self.out,
                    "\tmovzb{}\t{}, {}",
                    if self.size(*dst) == VRegSize::B64 { "q" } else { "l" },
                    d8,
                    self.reg_sized(*dst, self.size(*dst).max(VRegSize::B32))
                )?;
            }
            Inst::Branch { cc, lhs, rhs, dest } => {
                let label = self.fnbe.bbcon.blocks[*dest].label.clone();
                if cc.kind == CondKind::Any {
                    // Fallthrough jumps are not worth a byte.
                    if self.fnbe.bbcon.next_of(bb) != Some(*dest) {
                        writeln!(self.out, "\tjmp\t{}", label)?;
                    }
                } else if let (Some(l), Some(r)) = (lhs, rhs) {
                    let cc = self.emit_compare(*l, *r, *cc)?;
                    writeln!(self.out, "\tj{}\t{}", Self::cond_suffix(cc), label)?;
                }
            }
            Inst::BranchTable { index, targets } => {
                let table = self.local_label("tab");
                let idx = self.reg_sized(*index, VRegSize::B64);
                writeln!(self.out, "\tlea\t{}(%rip), %r11", table)?;
                writeln!(self.out, "\tjmp\t*(%r11,{},8)", idx)?;
                writeln!(self.out, "\t.section\t.rodata")?;
                writeln!(self.out, "\t.align\t8")?;
                writeln!(self.out, "{}:", table)?;
                for &t in targets {
                    writeln!(self.out, "\t.quad\t{}", self.fnbe.bbcon.blocks[t].label)?;
                }
                writeln!(self.out, "\t.text")?;
            }
            Inst::PreCall { .. } => {
                // The outgoing-argument area is part of the frame; nothing
                // to adjust here.
            }
            Inst::PushArg { index, src } => {
                if self.is_flo(*src) {
                    let mv = Self::fmov(self.size(*src));
                    if self.phys(*src) != *index as PhysReg {
                        writeln!(self.out, "\t{}\t{}, %xmm{}", mv, self.reg(*src), index)?;
                    }
                } else {
                    let size = self.size(*src).max(VRegSize::B32);
                    self.mov_into(*src, ARG_REGS[*index], size)?;
                }
            }
            Inst::Call { dst, target, vaarg, freg_arg_count, .. } => {
                if *vaarg {
                    writeln!(self.out, "\tmov\t${}, %eax", freg_arg_count)?;
                }
                match target {
                    CallTarget::Label(label) => writeln!(self.out, "\tcall\t{}", label)?,
                    CallTarget::Reg(v) => {
                        writeln!(self.out, "\tcall\t*{}", self.reg_sized(*v, VRegSize::B64))?
                    }
                }
                if let Some(d) = dst {
                    if self.is_flo(*d) {
                        if self.phys(*d) != 0 {
                            writeln!(self.out, "\t{}\t%xmm0, {}", Self::fmov(self.size(*d)), self.reg(*d))?;
                        }
                    } else {
                        let size = self.size(*d).max(VRegSize::B32);
                        if self.phys(*d) != RAX {
                            writeln!(
                                self.out,
                                "\tmov\t%{}, {}",
                                rname(RAX, size),
                                self.reg_sized(*d, size)
                            )?;
                        }
                    }
                }
            }
            Inst::Result { dst, src } => match dst {
                Some(d) => {
                    // Bind a produced value; same as a register move.
                    self.emit_inst(&Inst::Mov { dst: *d, src: *src }, bb)?;
                }
                None => {
                    if self.is_flo(*src) {
                        if self.phys(*src) != 0 {
                            writeln!(self.out, "\t{}\t{}, %xmm0", Self::fmov(self.size(*src)), self.reg(*src))?;
                        }
                    } else {
                        let size = self.size(*src).max(VRegSize::B32);
                        self.mov_into(*src, RAX, size)?;
                    }
                }
            },
            Inst::SubSp { amount } => {
                if self.is_const(*amount) {
                    writeln!(self.out, "\tsub\t${}, %rsp", self.cval(*amount))?;
                } else {
                    writeln!(self.out, "\tsub\t{}, %rsp", self.reg_sized(*amount, VRegSize::B64))?;
                }
            }
            Inst::Cast { dst, src, flags } => self.emit_cast(*dst, *src, *flags)?,
            Inst::Mov { dst, src } => {
                if self.is_flo(*dst) {
                    let mv = Self::fmov(self.size(*dst));
                    if self.is_const(*src) {
                        let label = if self.size(*dst) == VRegSize::B32 {
                            self.pool_label(PoolConst::F32(self.cval(*src) as u32))
                        } else {
                            self.pool_label(PoolConst::F64(self.cval(*src) as u64))
                        };
                        writeln!(self.out, "\t{}\t{}(%rip), {}", mv, label, self.reg(*dst))?;
                    } else if self.phys(*src) != self.phys(*dst) {
                        writeln!(self.out, "\t{}\t{}, {}", mv, self.reg(*src), self.reg(*dst))?;
                    }
                } else {
                    let size = self.size(*dst);
                    if self.is_const(*src) || self.phys(*src) != self.phys(*dst) {
                        self.mov_into(*src, self.phys(*dst), size)?;
                    }
                }
            }
            Inst::Keep { .. } => {}
            Inst::Phi { .. } => panic!("phi survived to emission"),
            Inst::Asm { text } => {
                writeln!(self.out, "\t{}", text)?;
            }
        }
        Ok(())
    }

    fn emit_cast(&mut self, dst: VReg, src: VReg, flags: IrFlags) -> CodegenResult<()> {
        let unsigned = flags.contains(IrFlags::UNSIGNED);
        match (self.is_flo(src), self.is_flo(dst)) {
            (false, false) => {
                let ssize = self.size(src);
                let dsize = self.size(dst);
                if self.is_const(src) {
                    return self.mov_into(src, self.phys(dst), dsize);
                }
                if dsize <= ssize {
                    // Truncation is a plain sized move.
                    if self.phys(src) != self.phys(dst) || dsize != ssize {
                        writeln!(
                            self.out,
                            "\tmov\t{}, {}",
                            self.reg_sized(src, dsize),
                            self.reg_sized(dst, dsize)
                        )?;
                    }
                    return Ok(());
                }
                let s = self.reg_sized(src, ssize);
                let d = self.reg_sized(dst, dsize);
                match (ssize, unsigned) {
                    (VRegSize::B32, true) => {
                        // A 32-bit move already zeroes the upper half.
                        writeln!(self.out, "\tmov\t{}, {}", s, self.reg_sized(dst, VRegSize::B32))?;
                    }
                    (VRegSize::B32, false) => writeln!(self.out, "\tmovslq\t{}, {}", s, d)?,
                    (_, true) => writeln!(self.out, "\tmovz{}\t{}, {}", ext_suffix(ssize, dsize), s, d)?,
                    (_, false) => writeln!(self.out, "\tmovs{}\t{}, {}", ext_suffix(ssize, dsize), s, d)?,
                }
            }
            (false, true) => {
                let fsfx = if self.size(dst) == VRegSize::B32 { "ss" } else { "sd" };
                let isfx = if self.size(src) == VRegSize::B64 { "q" } else { "l" };
                let ssize = self.size(src).max(VRegSize::B32);
                let s = if self.is_const(src) {
                    self.mov_into(src, INT_SCRATCH0, ssize)?;
                    format!("%{}", rname(INT_SCRATCH0, ssize))
                } else {
                    self.reg_sized(src, ssize)
                };
                writeln!(self.out, "\tcvtsi2{}{}\t{}, {}", fsfx, isfx, s, self.reg(dst))?;
            }
            (true, false) => {
                let fsfx = if self.size(src) == VRegSize::B32 { "ss" } else { "sd" };
                let dsize = self.size(dst).max(VRegSize::B32);
                writeln!(
                    self.out,
                    "\tcvtt{}2si\t{}, {}",
                    fsfx,
                    self.reg(src),
                    self.reg_sized(dst, dsize)
                )?;
            }
            (true, true) => {
                if self.size(src) != self.size(dst) {
                    let (from, to) = if self.size(dst) == VRegSize::B64 {
                        ("ss", "sd")
                    } else {
                        ("sd", "ss")
                    };
                    writeln!(self.out, "\tcvt{}2{}\t{}, {}", from, to, self.reg(src), self.reg(dst))?;
                } else if self.phys(src) != self.phys(dst) {
                    writeln!(self.out, "\t{}\t{}, {}", Self::fmov(self.size(dst)), self.reg(src), self.reg(dst))?;
                }
            }
        }
        Ok(())
    }
}

fn ext_suffix(from: VRegSize, to: VRegSize) -> &'static str {
    match (from, to) {
        (VRegSize::B8, VRegSize::B16) => "bw",
        (VRegSize::B8, VRegSize::B32) => "bl",
        (VRegSize::B8, VRegSize::B64) => "bq",
        (VRegSize::B16, VRegSize::B32) => "wl",
        (VRegSize::B16, VRegSize::B64) => "wq",
        (VRegSize::B32, VRegSize::B64) => "lq",
        _ => panic!("no extension from {:?} to {:?}", from, to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_tables_line_up() {
        assert_eq!(rname(RAX, VRegSize::B64), "rax");
        assert_eq!(rname(RAX, VRegSize::B32), "eax");
        assert_eq!(rname(RCX, VRegSize::B8), "cl");
        assert_eq!(rname(INT_SCRATCH0, VRegSize::B64), "r10");
        // Argument order is rdi, rsi, rdx, rcx, r8, r9.
        let names: Vec<&str> = ARG_REGS.iter().map(|&p| rname(p, VRegSize::B64)).collect();
        assert_eq!(names, ["rdi", "rsi", "rdx", "rcx", "r8", "r9"]);
    }

    #[test]
    fn masks_are_disjoint() {
        assert_eq!(CALLEE_SAVED & CALLER_SAVED, 0);
        assert_eq!(
            (CALLEE_SAVED | CALLER_SAVED).count_ones() as usize,
            INT_REG_COUNT
        );
    }
}
