//! Lowering from the typed AST to basic-block IR.
//!
//! One `IrBuilder` lowers one function. It owns the growing `FuncBackend`
//! and tracks the current block explicitly; there is no global "current
//! function" state. Values are virtual registers; aggregate-typed
//! expressions evaluate to the address of the aggregate.
//!
//! Placement rules: a local whose address is taken (or whose type does not
//! fit a register) lives on the stack frame and is only reached through
//! explicit address arithmetic; everything else becomes a vreg and is the
//! register allocator's problem.

use std::collections::HashMap;

use log::trace;

use crate::ir::{
    BinaryOp, Block, CallTarget, CondCode, CondKind, FrameInfo, FuncBackend, Inst, IrFlags,
    LocalSlot, LocalVar, ParamDest, RegParamInfo, UnaryOp, VReg, VRegFlags, VRegSize,
};
use crate::isa::TargetIsa;
use chert_ast::{
    BinOp, Diagnostics, Expr, ExprKind, Function, Name, SourceLoc, Stmt, Storage, Type, UnOp,
    VarId,
};

/// Module-wide generator of unique assembly labels.
#[derive(Default)]
pub struct LabelGen {
    next: u32,
}

impl LabelGen {
    /// Create the generator.
    pub fn new() -> LabelGen {
        Default::default()
    }

    /// Produce a fresh local label.
    pub fn next(&mut self) -> String {
        let n = self.next;
        self.next += 1;
        format!(".L{:03}", n)
    }
}

/// Read-only data pool for string literals, deduplicated by content.
#[derive(Default)]
pub struct StringPool {
    entries: Vec<(String, Vec<u8>)>,
}

impl StringPool {
    /// Create an empty pool.
    pub fn new() -> StringPool {
        Default::default()
    }

    /// Intern a literal and return its label.
    pub fn intern(&mut self, bytes: &[u8]) -> String {
        if let Some((label, _)) = self.entries.iter().find(|(_, b)| b == bytes) {
            return label.clone();
        }
        let label = format!(".LS{:03}", self.entries.len());
        self.entries.push((label.clone(), bytes.to_vec()));
        label
    }

    /// All interned literals.
    pub fn entries(&self) -> &[(String, Vec<u8>)] {
        &self.entries
    }
}

/// Does this type travel on the stack rather than in a register?
fn is_stack_param(ty: &Type) -> bool {
    ty.is_aggregate()
}

fn to_vsize(ty: &Type) -> VRegSize {
    VRegSize::from_bytes(ty.size(8))
}

fn to_vflags(ty: &Type) -> VRegFlags {
    let mut flags = VRegFlags::empty();
    if ty.is_flonum() {
        flags |= VRegFlags::FLONUM;
    }
    if ty.is_unsigned() {
        flags |= VRegFlags::UNSIGNED;
    }
    flags
}

struct SwitchCtx {
    case_blocks: Vec<Block>,
}

/// Per-function lowering state.
pub struct IrBuilder<'a> {
    func: &'a Function,
    diag: &'a mut Diagnostics,
    labels: &'a mut LabelGen,
    strings: &'a mut StringPool,
    fnbe: FuncBackend,
    curbb: Block,
    ret_block: Block,
    retval_ptr: Option<VReg>,
    slots: HashMap<VarId, LocalSlot>,
    break_stack: Vec<Block>,
    continue_stack: Vec<Block>,
    switch_stack: Vec<SwitchCtx>,
    goto_labels: HashMap<Name, Block>,
}

/// Lower one function definition. Returns `None` for prototypes.
pub fn gen_defun<'a>(
    func: &'a Function,
    isa: &dyn TargetIsa,
    diag: &'a mut Diagnostics,
    labels: &'a mut LabelGen,
    strings: &'a mut StringPool,
) -> Option<FuncBackend> {
    let body = func.body.as_ref()?;

    let mut fnbe = FuncBackend::default();
    let entry = fnbe.bbcon.add_block(labels.next());
    let ret_label = labels.next();
    let ret_block = fnbe.bbcon.create_block(ret_label);

    let mut builder = IrBuilder {
        func,
        diag,
        labels,
        strings,
        fnbe,
        curbb: entry,
        ret_block,
        retval_ptr: None,
        slots: HashMap::new(),
        break_stack: Vec::new(),
        continue_stack: Vec::new(),
        switch_stack: Vec::new(),
        goto_labels: HashMap::new(),
    };
    builder.alloc_variable_slots(isa);
    builder.gen_stmt(body);

    // Whatever falls off the end of the body reaches the shared exit.
    let ret_block = builder.ret_block;
    builder.fnbe.bbcon.append_block(ret_block);
    trace!(
        "{}: {} blocks, {} vregs",
        func.name,
        builder.fnbe.bbcon.order.len(),
        builder.fnbe.ra.vregs.len()
    );
    Some(builder.fnbe)
}

impl<'a> IrBuilder<'a> {
    fn emit(&mut self, inst: Inst) {
        self.fnbe.bbcon.blocks[self.curbb].insts.push(inst);
    }

    fn set_curbb(&mut self, bb: Block) {
        self.fnbe.bbcon.append_block(bb);
        self.curbb = bb;
    }

    fn new_block(&mut self) -> Block {
        let label = self.labels.next();
        self.fnbe.bbcon.create_block(label)
    }

    fn jump(&mut self, dest: Block) {
        self.emit(Inst::Branch {
            cc: CondCode::any(),
            lhs: None,
            rhs: None,
            dest,
        });
    }

    /// After an unconditional transfer the current block is finished;
    /// anything further lands in a fresh (unreachable) block.
    fn start_dead_block(&mut self) {
        let bb = self.new_block();
        self.set_curbb(bb);
    }

    fn new_vreg_of(&mut self, ty: &Type) -> VReg {
        self.fnbe.ra.new_vreg(to_vsize(ty), to_vflags(ty))
    }

    fn const_of(&mut self, value: i64, ty: &Type) -> VReg {
        self.fnbe
            .ra
            .constant_with(value, to_vsize(ty), to_vflags(ty))
    }

    fn const_i64(&mut self, value: i64) -> VReg {
        self.fnbe.ra.constant(value, VRegSize::B64)
    }

    /// Assign every declared variable its backend location up front.
    fn alloc_variable_slots(&mut self, isa: &dyn TargetIsa) {
        let mut ireg = 0usize;
        let mut freg = 0usize;
        let mut stack_offset: i32 = isa.stack_param_base();

        // A function returning an aggregate receives the result pointer as
        // a hidden leading integer argument.
        if self.func.ty.ret.is_aggregate() {
            let v = self
                .fnbe
                .ra
                .new_vreg(VRegSize::B64, VRegFlags::PARAM);
            self.fnbe.ra.vregs[v].param = Some(0);
            self.fnbe.reg_params.push(RegParamInfo {
                index: 0,
                flonum: false,
                size: VRegSize::B64,
                dest: ParamDest::Reg(v),
            });
            self.retval_ptr = Some(v);
            ireg = 1;
        }

        for &pid in &self.func.params {
            let info = match self.func.find_var(pid) {
                Some(info) => info.clone(),
                None => continue,
            };
            let slot = if is_stack_param(&info.ty) {
                // Aggregates always travel on the caller's stack.
                let align = info.ty.align(8).max(8) as i32;
                let size = info.ty.size(8).max(1) as i32;
                stack_offset = (stack_offset + align - 1) & !(align - 1);
                let fi = FrameInfo::at(stack_offset);
                self.fnbe.stack_params.push(fi.clone());
                stack_offset += (size + 7) & !7;
                LocalSlot::Frame(fi)
            } else if info.ty.is_flonum() && freg < isa.float_arg_reg_count() {
                let index = freg as u8;
                freg += 1;
                self.reg_param_slot(&info.ty, index, true, &info.storage)
            } else if !info.ty.is_flonum() && ireg < isa.int_arg_regs().len() {
                let index = ireg as u8;
                ireg += 1;
                self.reg_param_slot(&info.ty, index, false, &info.storage)
            } else {
                // Ran out of argument registers: the value is in memory
                // above the return address.
                stack_offset = (stack_offset + 7) & !7;
                let fi = FrameInfo::at(stack_offset);
                self.fnbe.stack_params.push(fi.clone());
                stack_offset += 8;
                if info.storage.contains(Storage::REF_TAKEN) {
                    LocalSlot::Frame(fi)
                } else {
                    // Load it into a vreg once, at function entry.
                    let v = self.new_vreg_of(&info.ty);
                    let addr = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
                    self.emit(Inst::FrameAddr {
                        dst: addr,
                        frame: fi,
                        offset: 0,
                    });
                    self.emit(Inst::Load { dst: v, addr });
                    LocalSlot::Reg(v)
                }
            };
            self.slots.insert(pid, slot.clone());
            self.fnbe.locals.push(LocalVar {
                var: Some(pid),
                name: info.name.clone(),
                slot,
                size: info.ty.size(8),
                align: info.ty.align(8),
            });
        }
        self.fnbe.ireg_param_count = ireg;
        self.fnbe.freg_param_count = freg;
        if stack_offset > isa.stack_param_base() {
            // Stack-passed parameters are addressed off the frame pointer.
            self.fnbe.ra.flags |= crate::regalloc::RegAllocFlags::STACK_FRAME;
        }

        // Plain locals, walked in scope order.
        for scope in self.func.scopes.values() {
            for info in &scope.vars {
                if !info.storage.is_local() || self.slots.contains_key(&info.id) {
                    continue;
                }
                if info.storage.contains(Storage::PARAM) {
                    continue; // handled above
                }
                if matches!(info.ty, Type::Func(_)) {
                    continue; // local function declaration, no storage
                }
                let slot = if info.storage.contains(Storage::REF_TAKEN)
                    || info.ty.is_aggregate()
                {
                    LocalSlot::Frame(FrameInfo::new())
                } else {
                    LocalSlot::Reg(self.new_vreg_of(&info.ty))
                };
                self.slots.insert(info.id, slot.clone());
                self.fnbe.locals.push(LocalVar {
                    var: Some(info.id),
                    name: info.name.clone(),
                    slot,
                    size: info.ty.size(8),
                    align: info.ty.align(8),
                });
            }
        }
    }

    /// Location for a register-passed parameter. An address-taken parameter
    /// lands in a frame slot right in the prologue; reads go through memory.
    fn reg_param_slot(
        &mut self,
        ty: &Type,
        index: u8,
        flonum: bool,
        storage: &Storage,
    ) -> LocalSlot {
        let size = to_vsize(ty);
        if storage.contains(Storage::REF_TAKEN) {
            let fi = FrameInfo::new();
            self.fnbe.reg_params.push(RegParamInfo {
                index,
                flonum,
                size,
                dest: ParamDest::Frame(fi.clone()),
            });
            return LocalSlot::Frame(fi);
        }
        let v = self
            .fnbe
            .ra
            .new_vreg(size, to_vflags(ty) | VRegFlags::PARAM);
        self.fnbe.ra.vregs[v].param = Some(index);
        self.fnbe.reg_params.push(RegParamInfo {
            index,
            flonum,
            size,
            dest: ParamDest::Reg(v),
        });
        LocalSlot::Reg(v)
    }

    // ---------------------------------------------------------------------
    // Statements

    fn gen_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Empty => {}
            Stmt::Expr(expr) => {
                self.gen_expr(expr);
            }
            Stmt::Block { stmts, .. } => {
                for s in stmts {
                    self.gen_stmt(s);
                }
            }
            Stmt::If {
                cond,
                then_br,
                else_br,
            } => self.gen_if(cond, then_br, else_br.as_deref()),
            Stmt::While { cond, body } => self.gen_while(cond, body),
            Stmt::DoWhile { body, cond } => self.gen_do_while(body, cond),
            Stmt::For {
                pre,
                cond,
                post,
                body,
            } => self.gen_for(pre.as_deref(), cond.as_ref(), post.as_ref(), body),
            Stmt::Switch { value, body, cases } => self.gen_switch(value, body, cases),
            Stmt::Case { index } => self.gen_case(*index),
            Stmt::Break => match self.break_stack.last() {
                Some(&dest) => {
                    self.jump(dest);
                    self.start_dead_block();
                }
                None => self.diag.error(SourceLoc::none(), "break outside of loop"),
            },
            Stmt::Continue => match self.continue_stack.last() {
                Some(&dest) => {
                    self.jump(dest);
                    self.start_dead_block();
                }
                None => self
                    .diag
                    .error(SourceLoc::none(), "continue outside of loop"),
            },
            Stmt::Goto { label, .. } => {
                let dest = self.label_block(label);
                self.jump(dest);
                self.start_dead_block();
            }
            Stmt::Label { name, stmt } => {
                let bb = self.label_block(name);
                // Fall through into the labelled block.
                self.set_curbb(bb);
                self.gen_stmt(stmt);
            }
            Stmt::Return { val } => self.gen_return(val.as_ref()),
            Stmt::VarDecl { init, .. } => {
                if let Some(init) = init {
                    self.gen_stmt(init);
                }
            }
            Stmt::Asm { text } => {
                self.emit(Inst::Asm { text: text.clone() });
            }
        }
    }

    fn label_block(&mut self, name: &Name) -> Block {
        if let Some(&bb) = self.goto_labels.get(name) {
            return bb;
        }
        let bb = self.new_block();
        self.goto_labels.insert(name.clone(), bb);
        bb
    }

    fn gen_if(&mut self, cond: &Expr, then_br: &Stmt, else_br: Option<&Stmt>) {
        let tbb = self.new_block();
        let fbb = self.new_block();
        if let Some(_else_br) = else_br {
            let next = self.new_block();
            self.gen_cond_jmp(cond, tbb, fbb);
            self.set_curbb(tbb);
            self.gen_stmt(then_br);
            self.jump(next);
            self.set_curbb(fbb);
            if let Some(e) = else_br {
                self.gen_stmt(e);
            }
            self.set_curbb(next);
        } else {
            self.gen_cond_jmp(cond, tbb, fbb);
            self.set_curbb(tbb);
            self.gen_stmt(then_br);
            self.set_curbb(fbb);
        }
    }

    fn gen_while(&mut self, cond: &Expr, body: &Stmt) {
        let header = self.new_block();
        let body_bb = self.new_block();
        let next = self.new_block();

        self.break_stack.push(next);
        self.continue_stack.push(header);

        self.set_curbb(header);
        self.gen_cond_jmp(cond, body_bb, next);
        self.set_curbb(body_bb);
        self.gen_stmt(body);
        self.jump(header);
        self.set_curbb(next);

        self.break_stack.pop();
        self.continue_stack.pop();
    }

    fn gen_do_while(&mut self, body: &Stmt, cond: &Expr) {
        let body_bb = self.new_block();
        let cond_bb = self.new_block();
        let next = self.new_block();

        self.break_stack.push(next);
        self.continue_stack.push(cond_bb);

        self.set_curbb(body_bb);
        self.gen_stmt(body);
        self.set_curbb(cond_bb);
        self.gen_cond_jmp(cond, body_bb, next);
        self.set_curbb(next);

        self.break_stack.pop();
        self.continue_stack.pop();
    }

    fn gen_for(
        &mut self,
        pre: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Expr>,
        body: &Stmt,
    ) {
        if let Some(pre) = pre {
            self.gen_stmt(pre);
        }
        let header = self.new_block();
        let body_bb = self.new_block();
        let cont_bb = self.new_block();
        let next = self.new_block();

        self.break_stack.push(next);
        self.continue_stack.push(cont_bb);

        self.set_curbb(header);
        if let Some(cond) = cond {
            self.gen_cond_jmp(cond, body_bb, next);
        }
        self.set_curbb(body_bb);
        self.gen_stmt(body);
        self.set_curbb(cont_bb);
        if let Some(post) = post {
            self.gen_expr(post);
        }
        self.jump(header);
        self.set_curbb(next);

        self.break_stack.pop();
        self.continue_stack.pop();
    }

    fn gen_switch(&mut self, value: &Expr, body: &Stmt, cases: &[chert_ast::CaseInfo]) {
        let next = self.new_block();
        let case_blocks: Vec<Block> = cases.iter().map(|_| self.new_block()).collect();
        let default_bb = cases
            .iter()
            .position(|c| c.value.is_none())
            .map(|i| case_blocks[i])
            .unwrap_or(next);

        let value_v = match self.gen_expr(value) {
            Some(v) => v,
            None => return,
        };

        let valued: Vec<(i64, Block)> = cases
            .iter()
            .zip(&case_blocks)
            .filter_map(|(c, &bb)| c.value.map(|v| (v, bb)))
            .collect();

        if let (Some(&(min, _)), Some(&(max, _))) = (
            valued.iter().min_by_key(|(v, _)| *v),
            valued.iter().max_by_key(|(v, _)| *v),
        ) {
            let count = valued.len() as i64;
            // Same density rule as the wasm dispatch: a table only when
            // (max - min + 1) / count <= 2, tested without flooring.
            let range = max as i128 - min as i128 + 1;
            if count >= 4 && range <= 2 * count as i128 {
                self.gen_switch_table_jump(value, value_v, min, range as i64, &valued, default_bb);
            } else {
                for &(v, bb) in &valued {
                    let c = self.const_of(v, &value.ty);
                    self.emit(Inst::Branch {
                        cc: CondCode::signed(CondKind::Eq),
                        lhs: Some(value_v),
                        rhs: Some(c),
                        dest: bb,
                    });
                }
                self.jump(default_bb);
            }
        } else {
            self.jump(default_bb);
        }
        self.start_dead_block();

        self.break_stack.push(next);
        self.switch_stack.push(SwitchCtx { case_blocks });
        self.gen_stmt(body);
        self.switch_stack.pop();
        self.break_stack.pop();
        self.set_curbb(next);
    }

    fn gen_switch_table_jump(
        &mut self,
        value: &Expr,
        value_v: VReg,
        min: i64,
        range: i64,
        valued: &[(i64, Block)],
        default_bb: Block,
    ) {
        // index = (value - min) as 64-bit; anything out of range goes to
        // the default through one unsigned compare.
        let wide = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::Cast {
            dst: wide,
            src: value_v,
            flags: if value.ty.is_unsigned() {
                IrFlags::UNSIGNED
            } else {
                IrFlags::empty()
            },
        });
        let index = if min != 0 {
            let m = self.const_i64(min);
            let idx = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
            self.emit(Inst::Binary {
                op: BinaryOp::Sub,
                dst: idx,
                lhs: wide,
                rhs: m,
                flags: IrFlags::empty(),
            });
            idx
        } else {
            wide
        };
        let bound = self.const_i64(range - 1);
        self.emit(Inst::Branch {
            cc: CondCode {
                kind: CondKind::Gt,
                unsigned: true,
            },
            lhs: Some(index),
            rhs: Some(bound),
            dest: default_bb,
        });

        let mut targets = vec![default_bb; range as usize];
        for &(v, bb) in valued {
            targets[(v - min) as usize] = bb;
        }
        self.emit(Inst::BranchTable { index, targets });
    }

    fn gen_case(&mut self, index: usize) {
        let bb = match self.switch_stack.last() {
            Some(ctx) => ctx.case_blocks[index],
            None => {
                self.diag
                    .error(SourceLoc::none(), "case label outside of switch");
                return;
            }
        };
        // The previous case body falls through into this one.
        self.set_curbb(bb);
    }

    fn gen_return(&mut self, val: Option<&Expr>) {
        if let Some(val) = val {
            if val.ty.is_aggregate() {
                if let (Some(src), Some(dst)) = (self.gen_expr(val), self.retval_ptr) {
                    self.gen_memcpy(&val.ty, dst, src);
                    self.emit(Inst::Result {
                        dst: None,
                        src: dst,
                    });
                }
            } else if let Some(v) = self.gen_expr(val) {
                self.emit(Inst::Result { dst: None, src: v });
            }
        }
        let dest = self.ret_block;
        self.jump(dest);
        self.start_dead_block();
    }

    // ---------------------------------------------------------------------
    // Conditional jumps

    /// Branch to `tbb` when `cond` is true, `fbb` otherwise.
    fn gen_cond_jmp(&mut self, cond: &Expr, tbb: Block, fbb: Block) {
        match &cond.kind {
            ExprKind::Fixnum(v) => {
                // The caller switches to the surviving block next.
                let dest = if *v != 0 { tbb } else { fbb };
                self.jump(dest);
                return;
            }
            ExprKind::Bin { op, lhs, rhs } if op.is_compare() => {
                let cc = CondCode {
                    kind: compare_kind(*op),
                    unsigned: lhs.ty.is_unsigned(),
                };
                if let (Some(l), Some(r)) = (self.gen_expr(lhs), self.gen_expr(rhs)) {
                    self.emit(Inst::Branch {
                        cc,
                        lhs: Some(l),
                        rhs: Some(r),
                        dest: tbb,
                    });
                    self.jump(fbb);
                }
                return;
            }
            ExprKind::Bin {
                op: BinOp::LogAnd,
                lhs,
                rhs,
            } => {
                let mid = self.new_block();
                self.gen_cond_jmp(lhs, mid, fbb);
                self.set_curbb(mid);
                self.gen_cond_jmp(rhs, tbb, fbb);
                return;
            }
            ExprKind::Bin {
                op: BinOp::LogOr,
                lhs,
                rhs,
            } => {
                let mid = self.new_block();
                self.gen_cond_jmp(lhs, tbb, mid);
                self.set_curbb(mid);
                self.gen_cond_jmp(rhs, tbb, fbb);
                return;
            }
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs);
                self.gen_cond_jmp(rhs, tbb, fbb);
                return;
            }
            _ => {}
        }
        // Fall back to value != 0.
        if let Some(v) = self.gen_expr(cond) {
            let zero = self.const_of(0, &cond.ty);
            self.emit(Inst::Branch {
                cc: CondCode {
                    kind: CondKind::Ne,
                    unsigned: cond.ty.is_unsigned(),
                },
                lhs: Some(v),
                rhs: Some(zero),
                dest: tbb,
            });
            self.jump(fbb);
        }
    }

    // ---------------------------------------------------------------------
    // Expressions

    fn gen_expr(&mut self, expr: &Expr) -> Option<VReg> {
        match &expr.kind {
            ExprKind::Fixnum(v) => Some(self.const_of(*v, &expr.ty)),
            ExprKind::Flonum(v) => {
                let size = to_vsize(&expr.ty);
                let bits = if size == VRegSize::B32 {
                    (*v as f32).to_bits() as i64
                } else {
                    v.to_bits() as i64
                };
                let c = self
                    .fnbe
                    .ra
                    .constant_with(bits, size, VRegFlags::FLONUM);
                // Materialize immediately so constants only ever appear as
                // move sources on the float side.
                let dst = self.new_vreg_of(&expr.ty);
                self.emit(Inst::Mov { dst, src: c });
                Some(dst)
            }
            ExprKind::Str(bytes) => {
                let label = self.strings.intern(bytes);
                let dst = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
                self.emit(Inst::LabelAddr {
                    dst,
                    label,
                    offset: 0,
                });
                Some(dst)
            }
            ExprKind::Var { .. } => self.gen_var_value(expr),
            ExprKind::Unary { op, sub } => self.gen_unary(expr, *op, sub),
            ExprKind::Cast { sub } => self.gen_cast(expr, sub),
            ExprKind::Bin { op, lhs, rhs } => self.gen_binop(expr, *op, lhs, rhs),
            ExprKind::Assign { lhs, rhs } => self.gen_assign(lhs, rhs),
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs);
                self.gen_expr(rhs)
            }
            ExprKind::Member { .. } => {
                let addr = self.gen_lval(expr)?;
                self.load_from(addr, &expr.ty)
            }
            ExprKind::Funcall { func, args } => self.gen_funcall(expr, func, args),
        }
    }

    fn load_from(&mut self, addr: VReg, ty: &Type) -> Option<VReg> {
        // Aggregates evaluate to their address; a function designator is
        // its address already.
        if ty.is_aggregate() || matches!(ty, Type::Func(_)) {
            return Some(addr);
        }
        let dst = self.new_vreg_of(ty);
        self.emit(Inst::Load { dst, addr });
        Some(dst)
    }

    fn gen_var_value(&mut self, expr: &Expr) -> Option<VReg> {
        let (id, name) = match &expr.kind {
            ExprKind::Var { id, name } => (id, name),
            _ => return None,
        };
        if let Some(id) = id {
            match self.slots.get(id).cloned() {
                Some(LocalSlot::Reg(v)) => return Some(v),
                Some(LocalSlot::Frame(fi)) => {
                    let addr = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
                    self.emit(Inst::FrameAddr {
                        dst: addr,
                        frame: fi,
                        offset: 0,
                    });
                    return self.load_from(addr, &expr.ty);
                }
                None => {}
            }
        }
        // Global, static, or extern: reach it through its symbol.
        let addr = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::LabelAddr {
            dst: addr,
            label: name.to_string(),
            offset: 0,
        });
        if matches!(expr.ty, Type::Func(_)) {
            return Some(addr);
        }
        self.load_from(addr, &expr.ty)
    }

    /// Evaluate an lvalue expression to the address of its storage.
    fn gen_lval(&mut self, expr: &Expr) -> Option<VReg> {
        match &expr.kind {
            ExprKind::Var { id, name } => {
                if let Some(id) = id {
                    match self.slots.get(id).cloned() {
                        Some(LocalSlot::Frame(fi)) => {
                            let dst =
                                self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
                            self.emit(Inst::FrameAddr {
                                dst,
                                frame: fi,
                                offset: 0,
                            });
                            return Some(dst);
                        }
                        Some(LocalSlot::Reg(_)) => {
                            self.diag.error(
                                expr.loc,
                                format!("address taken of register variable '{}'", name),
                            );
                            return None;
                        }
                        None => {}
                    }
                }
                let dst = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
                self.emit(Inst::LabelAddr {
                    dst,
                    label: name.to_string(),
                    offset: 0,
                });
                Some(dst)
            }
            ExprKind::Unary {
                op: UnOp::Deref,
                sub,
            } => self.gen_expr(sub),
            ExprKind::Member { sub, offset, .. } => {
                let base = self.gen_lval(sub)?;
                if *offset == 0 {
                    return Some(base);
                }
                let off = self.const_i64(*offset as i64);
                let dst = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
                self.emit(Inst::Binary {
                    op: BinaryOp::Add,
                    dst,
                    lhs: base,
                    rhs: off,
                    flags: IrFlags::empty(),
                });
                Some(dst)
            }
            ExprKind::Str(_) => self.gen_expr(expr),
            _ => {
                self.diag.error(expr.loc, "expression is not assignable");
                None
            }
        }
    }

    fn gen_unary(&mut self, expr: &Expr, op: UnOp, sub: &Expr) -> Option<VReg> {
        match op {
            UnOp::Ref => self.gen_lval(sub),
            UnOp::Deref => {
                let addr = self.gen_expr(sub)?;
                self.load_from(addr, &expr.ty)
            }
            UnOp::Neg | UnOp::BitNot => {
                let src = self.gen_expr(sub)?;
                let dst = self.new_vreg_of(&expr.ty);
                let op = if op == UnOp::Neg {
                    UnaryOp::Neg
                } else {
                    UnaryOp::BitNot
                };
                self.emit(Inst::Unary { op, dst, src });
                Some(dst)
            }
        }
    }

    fn gen_cast(&mut self, expr: &Expr, sub: &Expr) -> Option<VReg> {
        let src = self.gen_expr(sub)?;
        if matches!(expr.ty, Type::Void) {
            return None;
        }
        let dst = self.new_vreg_of(&expr.ty);
        self.emit(Inst::Cast {
            dst,
            src,
            flags: if sub.ty.is_unsigned() {
                IrFlags::UNSIGNED
            } else {
                IrFlags::empty()
            },
        });
        Some(dst)
    }

    fn gen_binop(&mut self, expr: &Expr, op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<VReg> {
        if op.is_compare() {
            let cc = CondCode {
                kind: compare_kind(op),
                unsigned: lhs.ty.is_unsigned(),
            };
            let l = self.gen_expr(lhs)?;
            let r = self.gen_expr(rhs)?;
            let dst = self.new_vreg_of(&expr.ty);
            self.emit(Inst::SetCond {
                cc,
                dst,
                lhs: l,
                rhs: r,
            });
            return Some(dst);
        }
        if matches!(op, BinOp::LogAnd | BinOp::LogOr) {
            return self.gen_logical(expr);
        }

        // Pointer arithmetic scales the integer operand by element size.
        if let Some(elem) = lhs.ty.pointee() {
            if matches!(op, BinOp::Add | BinOp::Sub) && rhs.ty.is_fixnum() {
                let elem_size = elem.size(8).max(1) as i64;
                let base = self.gen_expr(lhs)?;
                let idx = self.gen_expr(rhs)?;
                let scaled = self.scale_index(idx, &rhs.ty, elem_size);
                let dst = self.new_vreg_of(&expr.ty);
                self.emit(Inst::Binary {
                    op: binary_op(op),
                    dst,
                    lhs: base,
                    rhs: scaled,
                    flags: IrFlags::empty(),
                });
                return Some(dst);
            }
            if op == BinOp::Sub && rhs.ty.pointee().is_some() {
                let elem_size = elem.size(8).max(1) as i64;
                let l = self.gen_expr(lhs)?;
                let r = self.gen_expr(rhs)?;
                let diff = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
                self.emit(Inst::Binary {
                    op: BinaryOp::Sub,
                    dst: diff,
                    lhs: l,
                    rhs: r,
                    flags: IrFlags::empty(),
                });
                if elem_size == 1 {
                    return Some(diff);
                }
                let c = self.const_i64(elem_size);
                let dst = self.new_vreg_of(&expr.ty);
                self.emit(Inst::Binary {
                    op: BinaryOp::Div,
                    dst,
                    lhs: diff,
                    rhs: c,
                    flags: IrFlags::empty(),
                });
                return Some(dst);
            }
        }

        let flags = if expr.ty.is_unsigned() {
            IrFlags::UNSIGNED
        } else {
            IrFlags::empty()
        };
        let l = self.gen_expr(lhs)?;
        let r = self.gen_expr(rhs)?;
        let dst = self.new_vreg_of(&expr.ty);
        self.emit(Inst::Binary {
            op: binary_op(op),
            dst,
            lhs: l,
            rhs: r,
            flags,
        });
        Some(dst)
    }

    /// Cast `idx` to pointer width and multiply by the element size.
    fn scale_index(&mut self, idx: VReg, idx_ty: &Type, elem_size: i64) -> VReg {
        let wide = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::Cast {
            dst: wide,
            src: idx,
            flags: if idx_ty.is_unsigned() {
                IrFlags::UNSIGNED
            } else {
                IrFlags::empty()
            },
        });
        if elem_size == 1 {
            return wide;
        }
        let c = self.const_i64(elem_size);
        let scaled = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::Binary {
            op: BinaryOp::Mul,
            dst: scaled,
            lhs: wide,
            rhs: c,
            flags: IrFlags::empty(),
        });
        scaled
    }

    /// `&&` and `||` in a value position produce 0 or 1 through control
    /// flow, like any other branch.
    fn gen_logical(&mut self, expr: &Expr) -> Option<VReg> {
        let tbb = self.new_block();
        let fbb = self.new_block();
        let next = self.new_block();
        let dst = self.new_vreg_of(&expr.ty);
        self.gen_cond_jmp(expr, tbb, fbb);
        self.set_curbb(tbb);
        let one = self.const_of(1, &expr.ty);
        self.emit(Inst::Mov { dst, src: one });
        self.jump(next);
        self.set_curbb(fbb);
        let zero = self.const_of(0, &expr.ty);
        self.emit(Inst::Mov { dst, src: zero });
        self.set_curbb(next);
        Some(dst)
    }

    fn gen_assign(&mut self, lhs: &Expr, rhs: &Expr) -> Option<VReg> {
        // A register-resident variable takes a plain move.
        if let ExprKind::Var { id: Some(id), .. } = &lhs.kind {
            if let Some(LocalSlot::Reg(dst)) = self.slots.get(id).cloned() {
                let src = self.gen_expr(rhs)?;
                self.emit(Inst::Mov { dst, src });
                return Some(src);
            }
        }
        if lhs.ty.is_aggregate() {
            let dst = self.gen_lval(lhs)?;
            let src = self.gen_expr(rhs)?;
            self.gen_memcpy(&lhs.ty, dst, src);
            return Some(dst);
        }
        let addr = self.gen_lval(lhs)?;
        let src = self.gen_expr(rhs)?;
        self.emit(Inst::Store { addr, src });
        Some(src)
    }

    /// Copy an aggregate, unrolled in word-size chunks.
    fn gen_memcpy(&mut self, ty: &Type, dst: VReg, src: VReg) {
        let total = ty.size(8);
        let mut offset = 0usize;
        while offset < total {
            let chunk = [8usize, 4, 2, 1]
                .iter()
                .copied()
                .find(|&c| c <= total - offset && offset % c == 0)
                .unwrap_or(1);
            let size = VRegSize::from_bytes(chunk);
            let tmp = self.fnbe.ra.new_vreg(size, VRegFlags::empty());
            let from = self.addr_plus(src, offset as i64);
            self.emit(Inst::Load {
                dst: tmp,
                addr: from,
            });
            let to = self.addr_plus(dst, offset as i64);
            self.emit(Inst::Store {
                addr: to,
                src: tmp,
            });
            offset += chunk;
        }
    }

    fn addr_plus(&mut self, base: VReg, offset: i64) -> VReg {
        if offset == 0 {
            return base;
        }
        let c = self.const_i64(offset);
        let dst = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::Binary {
            op: BinaryOp::Add,
            dst,
            lhs: base,
            rhs: c,
            flags: IrFlags::empty(),
        });
        dst
    }

    // ---------------------------------------------------------------------
    // Calls

    fn gen_funcall(&mut self, expr: &Expr, func: &Expr, args: &[Expr]) -> Option<VReg> {
        if let ExprKind::Var { name, .. } = &func.kind {
            match &**name {
                "__builtin_va_start" => return self.gen_builtin_va_start(expr, args),
                "__builtin_va_end" => return None,
                "__builtin_alloca" => return self.gen_builtin_alloca(args),
                _ => {}
            }
        }

        let ret_aggregate = expr.ty.is_aggregate();

        // Evaluate every argument before the call sequence starts, so no
        // other call can slip in between PUSHARG and CALL.
        let mut values: Vec<(VReg, bool, Option<&Type>)> = Vec::new();
        for arg in args {
            let v = self.gen_expr(arg)?;
            let aggregate = arg.ty.is_aggregate();
            values.push((v, arg.ty.is_flonum(), aggregate.then(|| &arg.ty)));
        }

        // An aggregate-returning call gets a scratch slot in the caller's
        // frame and passes its address as a hidden first argument.
        let ret_slot = if ret_aggregate {
            let fi = FrameInfo::new();
            self.fnbe.locals.push(LocalVar {
                var: None,
                name: "<retval>".into(),
                slot: LocalSlot::Frame(fi.clone()),
                size: expr.ty.size(8),
                align: expr.ty.align(8),
            });
            Some(fi)
        } else {
            None
        };

        let target = match &func.kind {
            // A function designator is a direct call; a pointer-typed
            // variable of the same shape is not.
            ExprKind::Var { name, id: None } if matches!(func.ty, Type::Func(_)) => {
                CallTarget::Label(name.to_string())
            }
            _ => match self.gen_expr(func) {
                Some(v) => CallTarget::Reg(v),
                None => return None,
            },
        };

        self.emit(Inst::PreCall {
            arg_count: args.len(),
        });

        // Stack arguments first: aggregates always, primitives that ran out
        // of registers. Their bytes live in the outgoing-argument area.
        let max_ireg = 6usize;
        let max_freg = 8usize;
        let mut ireg = ret_aggregate as usize;
        let mut freg = 0usize;
        let mut stack_offset = 0i64;
        let mut reg_moves: Vec<(usize, VReg)> = Vec::new();
        for (v, flonum, aggregate) in &values {
            if let Some(ty) = aggregate {
                let align = ty.align(8).max(8) as i64;
                let size = ty.size(8) as i64;
                stack_offset = (stack_offset + align - 1) & !(align - 1);
                let slot_addr = self.stack_arg_addr(stack_offset);
                self.gen_memcpy(ty, slot_addr, *v);
                stack_offset += (size + 7) & !7;
            } else if *flonum && freg < max_freg {
                reg_moves.push((freg, *v));
                freg += 1;
            } else if !*flonum && ireg < max_ireg {
                reg_moves.push((ireg, *v));
                ireg += 1;
            } else {
                stack_offset = (stack_offset + 7) & !7;
                let slot_addr = self.stack_arg_addr(stack_offset);
                self.emit(Inst::Store {
                    addr: slot_addr,
                    src: *v,
                });
                stack_offset += 8;
            }
        }
        if stack_offset > self.fnbe.stack_work_size {
            self.fnbe.stack_work_size = (stack_offset + 15) & !15;
        }

        let mut ret_slot_addr = None;
        if let Some(fi) = &ret_slot {
            let addr = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
            self.emit(Inst::FrameAddr {
                dst: addr,
                frame: fi.clone(),
                offset: 0,
            });
            self.emit(Inst::PushArg {
                index: 0,
                src: addr,
            });
            ret_slot_addr = Some(addr);
        }
        for (index, v) in reg_moves {
            self.emit(Inst::PushArg { index, src: v });
        }

        let vaarg = func.ty.func_type().map_or(false, |ft| ft.vaargs);
        let dst = if ret_aggregate || matches!(expr.ty, Type::Void) {
            None
        } else {
            Some(self.new_vreg_of(&expr.ty))
        };
        self.emit(Inst::Call {
            dst,
            target,
            arg_count: args.len(),
            reg_arg_count: ireg,
            freg_arg_count: freg,
            vaarg,
        });
        self.fnbe.funcall_count += 1;

        if ret_slot.is_some() {
            if let Some(addr) = ret_slot_addr {
                // The slot address doubles as the call's value; the KEEP
                // stretches its live range over the call so the allocator
                // parks it somewhere call-safe.
                self.emit(Inst::Keep {
                    dst: None,
                    opr1: Some(addr),
                    opr2: None,
                });
                return Some(addr);
            }
        }
        dst
    }

    fn stack_arg_addr(&mut self, offset: i64) -> VReg {
        let c = self.const_i64(offset);
        let dst = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::StackAddr { dst, offset: c });
        dst
    }

    fn gen_builtin_va_start(&mut self, expr: &Expr, args: &[Expr]) -> Option<VReg> {
        if !self.func.ty.vaargs {
            self.diag
                .error(expr.loc, "va_start outside of a variadic function");
            return None;
        }
        if args.len() != 2 {
            self.diag.error(expr.loc, "va_start expects two arguments");
            return None;
        }
        // ap = <pointer to the register save area>; this is an assignment,
        // so a register-resident `ap` takes a plain move.
        let area = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::FrameAddr {
            dst: area,
            frame: self.fnbe.vaarg_frame.clone(),
            offset: 0,
        });
        if let ExprKind::Var { id: Some(id), .. } = &args[0].kind {
            if let Some(LocalSlot::Reg(dst)) = self.slots.get(id).cloned() {
                self.emit(Inst::Mov { dst, src: area });
                return None;
            }
        }
        let ap_addr = self.gen_lval(&args[0])?;
        self.emit(Inst::Store {
            addr: ap_addr,
            src: area,
        });
        None
    }

    fn gen_builtin_alloca(&mut self, args: &[Expr]) -> Option<VReg> {
        let arg = args.first()?;
        let amount = self.gen_expr(arg)?;
        let wide = self.scale_index(amount, &arg.ty, 1);
        // Round up to the call alignment before moving the stack pointer.
        let fifteen = self.const_i64(15);
        let rounded = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::Binary {
            op: BinaryOp::Add,
            dst: rounded,
            lhs: wide,
            rhs: fifteen,
            flags: IrFlags::empty(),
        });
        let mask = self.const_i64(!15);
        let aligned = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::Binary {
            op: BinaryOp::BitAnd,
            dst: aligned,
            lhs: rounded,
            rhs: mask,
            flags: IrFlags::empty(),
        });
        self.emit(Inst::SubSp { amount: aligned });

        // The fresh area sits below the outgoing-argument area, whose size
        // is only known once every call site has been seen.
        let placeholder = match self.fnbe.stack_work_size_vreg {
            Some(v) => v,
            None => {
                let v = self.const_i64(0);
                self.fnbe.stack_work_size_vreg = Some(v);
                v
            }
        };
        let dst = self.fnbe.ra.new_vreg(VRegSize::B64, VRegFlags::empty());
        self.emit(Inst::StackAddr {
            dst,
            offset: placeholder,
        });
        self.fnbe.ra.flags |= crate::regalloc::RegAllocFlags::STACK_FRAME;
        Some(dst)
    }
}

fn compare_kind(op: BinOp) -> CondKind {
    match op {
        BinOp::Eq => CondKind::Eq,
        BinOp::Ne => CondKind::Ne,
        BinOp::Lt => CondKind::Lt,
        BinOp::Le => CondKind::Le,
        BinOp::Ge => CondKind::Ge,
        BinOp::Gt => CondKind::Gt,
        _ => panic!("{:?} is not a comparison", op),
    }
}

fn binary_op(op: BinOp) -> BinaryOp {
    match op {
        BinOp::Add => BinaryOp::Add,
        BinOp::Sub => BinaryOp::Sub,
        BinOp::Mul => BinaryOp::Mul,
        BinOp::Div => BinaryOp::Div,
        BinOp::Mod => BinaryOp::Mod,
        BinOp::BitAnd => BinaryOp::BitAnd,
        BinOp::BitOr => BinaryOp::BitOr,
        BinOp::BitXor => BinaryOp::BitXor,
        BinOp::LShift => BinaryOp::LShift,
        BinOp::RShift => BinaryOp::RShift,
        other => panic!("{:?} has no direct machine form", other),
    }
}
