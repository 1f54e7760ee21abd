//! Translation of one C function body into a wasm code-section entry.
//!
//! The translator walks the typed AST directly. Statements map onto wasm's
//! structured control flow (`block`/`loop`/`if`); expressions are emitted
//! stack-style with a `needval` flag saying whether the value is consumed.
//!
//! Locals fall into two camps: primitives that nobody takes the address of
//! become real wasm locals (declared in the canonical i32/i64/f32/f64
//! bucket order); everything else lives on the shadow-stack frame reached
//! through the base-pointer local. Forward `goto`s emit a `br` with a
//! placeholder depth that is patched — a single ULEB128 byte — once the
//! label's depth is known; backward or too-deep gotos are diagnosed.

use std::collections::HashMap;

use log::trace;

use crate::module::{func_sig, to_wtype, GVarPlace, ModuleEmitter, PTR_SIZE, STACK_ALIGN};
use crate::opcodes::*;
use crate::state::{CodeStream, GotoPatch, TranslationState};
use crate::WasmResult;
use chert_ast::{
    BinOp, CaseInfo, Diagnostics, Expr, ExprKind, Function, Name, SourceLoc, Stmt, Storage,
    Type, UnOp, VarId,
};

fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

/// Where one local variable lives.
#[derive(Clone, Copy, Debug)]
enum WasmLocal {
    /// A wasm local of the given index.
    Local(u32),
    /// A shadow-stack frame slot at this offset from the base pointer.
    Frame(i32),
}

/// Translates one function body.
pub struct FuncTranslator<'a> {
    me: &'a mut ModuleEmitter,
    func: &'a Function,
    diag: &'a mut Diagnostics,
    code: CodeStream,
    state: TranslationState,
    locals: HashMap<VarId, WasmLocal>,
    /// Register-class parameters whose address is taken: (param local,
    /// frame offset, type); stored to the frame in the prologue.
    ref_params: Vec<(u32, i32, Type)>,
    frame_size: u32,
    bp_local: Option<u32>,
    va_param: Option<u32>,
    ret_param: bool,
    /// Outgoing area base offset (from bp) per call site, in source order.
    call_areas: Vec<i32>,
    call_counter: usize,
    /// Per-case block indices of the switches being translated (innermost
    /// last); negative entries share the previous body block.
    switch_blocks: Vec<Vec<i32>>,
}

impl<'a> FuncTranslator<'a> {
    pub(crate) fn new(
        me: &'a mut ModuleEmitter,
        func: &'a Function,
        diag: &'a mut Diagnostics,
    ) -> FuncTranslator<'a> {
        FuncTranslator {
            me,
            func,
            diag,
            code: CodeStream::new(),
            state: TranslationState::new(),
            locals: HashMap::new(),
            ref_params: Vec::new(),
            frame_size: 0,
            bp_local: None,
            va_param: None,
            ret_param: false,
            call_areas: Vec::new(),
            call_counter: 0,
            switch_blocks: Vec::new(),
        }
    }

    /// Produce the code-section entry: locals vector plus expression.
    pub(crate) fn translate(mut self) -> WasmResult<Vec<u8>> {
        self.allocate_local_variables();
        self.emit_prologue();

        let func = self.func;
        if let Some(body) = &func.body {
            self.gen_stmt(body, true);

            if !matches!(func.ty.ret, Type::Void) && !ends_with_return(body) {
                self.code.push(OP_UNREACHABLE);
            }
        }

        self.emit_epilogue();

        // Unresolved patches are backward (or missing) labels.
        for patch in &self.state.goto_patches {
            self.diag.error(
                SourceLoc::none(),
                format!(
                    "unsupported goto: label '{}' not reachable forward",
                    patch.label
                ),
            );
        }
        debug_assert_eq!(self.state.cur_depth, 0);
        trace!("{}: {} bytes of code", self.func.name, self.code.len());
        Ok(self.code.into_bytes())
    }

    // -----------------------------------------------------------------
    // Locals

    fn allocate_local_variables(&mut self) {
        self.ret_param = self.func.ty.ret.is_aggregate();
        let param_base = self.ret_param as u32;
        let param_count = self.func.params.len() as u32;
        if self.func.ty.vaargs {
            self.va_param = Some(param_base + param_count);
        }

        // Params occupy the leading local indices. (Aggregates arrive as
        // pointers, so every parameter is a single wasm param.)
        for (i, &pid) in self.func.params.iter().enumerate() {
            self.locals.insert(pid, WasmLocal::Local(param_base + i as u32));
        }

        // Walk the scopes bucketing plain locals by wasm type and pushing
        // everything address-taken (or aggregate) onto the frame. An
        // address-taken register parameter gets a frame slot too; the
        // prologue banks it there.
        let mut counts = [0u32; 4]; // i32, i64, f32, f64
        let mut frame_vars: Vec<(VarId, u32, u32, bool)> = Vec::new(); // (id, size, align, is_param)
        let mut bucketed: Vec<(VarId, usize)> = Vec::new();
        for scope in self.func.scopes.values() {
            for info in &scope.vars {
                if !info.storage.is_local() || matches!(info.ty, Type::Func(_)) {
                    continue;
                }
                let is_param = info.storage.contains(Storage::PARAM);
                let ref_taken = info.storage.contains(Storage::REF_TAKEN);
                if ref_taken && info.ty.is_prim() {
                    frame_vars.push((
                        info.id,
                        info.ty.size(PTR_SIZE).max(1) as u32,
                        info.ty.align(PTR_SIZE).max(1) as u32,
                        is_param,
                    ));
                } else if !is_param && info.ty.is_aggregate() {
                    frame_vars.push((
                        info.id,
                        info.ty.size(PTR_SIZE).max(1) as u32,
                        info.ty.align(PTR_SIZE).max(1) as u32,
                        false,
                    ));
                } else if !is_param {
                    let wt = to_wtype(&info.ty);
                    let bucket = (WT_I32 - wt) as usize;
                    bucketed.push((info.id, bucket));
                    counts[bucket] += 1;
                }
            }
        }

        // Frame offsets: locals pack upward and live just under the frame
        // top, `[-locals_area, 0)` from the base pointer.
        let mut cursor = 0u32;
        let mut offsets: Vec<(VarId, u32, bool)> = Vec::new();
        for (id, size, align, is_param) in &frame_vars {
            cursor = align_up(cursor, *align);
            offsets.push((*id, cursor, *is_param));
            cursor += size;
        }
        let locals_area = align_up(cursor, STACK_ALIGN);

        // Pre-measure per-call outgoing space (aggregate copies, variadic
        // packs, aggregate return slots); it sits below the locals.
        let mut areas = Vec::new();
        if let Some(body) = &self.func.body {
            measure_stmt(body, &mut areas);
        }
        let outgoing: u32 = align_up(areas.iter().sum::<u32>(), STACK_ALIGN);
        self.frame_size = locals_area + outgoing;

        let stack_modified = self
            .func
            .flags
            .contains(chert_ast::FuncFlags::STACK_MODIFIED);
        let needs_bp = self.frame_size > 0 || stack_modified;

        // Wasm local indices: params, then the buckets in canonical
        // i32/i64/f32/f64 order, with the base pointer as one extra i32.
        let mut next = param_base + param_count + self.func.ty.vaargs as u32;
        let mut bucket_cursor = [0u32; 4];
        for b in 0..4 {
            bucket_cursor[b] = next;
            next += counts[b];
            if b == 0 && needs_bp {
                self.bp_local = Some(next);
                next += 1;
            }
        }
        for (id, bucket) in bucketed {
            self.locals.insert(id, WasmLocal::Local(bucket_cursor[bucket]));
            bucket_cursor[bucket] += 1;
        }
        let func = self.func;
        for (id, rel, is_param) in offsets {
            let offset = rel as i32 - locals_area as i32;
            if is_param {
                if let Some(WasmLocal::Local(idx)) = self.locals.get(&id).copied() {
                    if let Some(info) = func.find_var(id) {
                        self.ref_params.push((idx, offset, info.ty.clone()));
                    }
                }
            }
            self.locals.insert(id, WasmLocal::Frame(offset));
        }

        // Call-area bases, from the bottom of the frame upward.
        let mut base = -(self.frame_size as i32);
        for size in &areas {
            self.call_areas.push(base);
            base += *size as i32;
        }

        // Locals declaration, four buckets in canonical order.
        let mut groups: Vec<(u32, u8)> = Vec::new();
        let bucket_types = [WT_I32, WT_I64, WT_F32, WT_F64];
        for b in 0..4 {
            let n = counts[b] + if b == 0 { needs_bp as u32 } else { 0 };
            if n > 0 {
                groups.push((n, bucket_types[b]));
            }
        }
        self.code.uleb128(groups.len() as u64);
        for (n, wt) in groups {
            self.code.uleb128(n as u64);
            self.code.push(wt);
        }
    }

    // -----------------------------------------------------------------
    // Prologue / epilogue

    fn emit_prologue(&mut self) {
        if let Some(bp) = self.bp_local {
            // local.bp = global.sp; global.sp = bp - frame_size;
            self.code.push(OP_GLOBAL_GET);
            self.code.uleb128(0);
            self.code.push(OP_LOCAL_SET);
            self.code.uleb128(bp as u64);
            if self.frame_size > 0 {
                self.code.push(OP_LOCAL_GET);
                self.code.uleb128(bp as u64);
                self.code.push(OP_I32_CONST);
                self.code.sleb128(self.frame_size as i64);
                self.code.push(OP_I32_SUB);
                self.code.push(OP_GLOBAL_SET);
                self.code.uleb128(0);
            }

            // Bank address-taken parameters in their frame slots.
            for (idx, offset, ty) in self.ref_params.clone() {
                self.gen_bpofs(offset);
                self.code.push(OP_LOCAL_GET);
                self.code.uleb128(idx as u64);
                self.gen_store(&ty);
            }

            // The body runs inside one block so an early return can br out
            // and still restore the stack pointer.
            let wt = ret_wtype(&self.func.ty.ret);
            self.code.push(OP_BLOCK);
            self.code.push(wt);
            self.state.cur_depth += 1;
        }
    }

    fn emit_epilogue(&mut self) {
        if let Some(bp) = self.bp_local {
            self.code.push(OP_END);
            self.state.cur_depth -= 1;
            // global.sp = bp;
            self.code.push(OP_LOCAL_GET);
            self.code.uleb128(bp as u64);
            self.code.push(OP_GLOBAL_SET);
            self.code.uleb128(0);
        }
        self.code.push(OP_END);
    }

    // -----------------------------------------------------------------
    // Addressing helpers

    /// Push `bp + offset`.
    fn gen_bpofs(&mut self, offset: i32) {
        let bp = match self.bp_local {
            Some(bp) => bp,
            None => {
                self.diag
                    .error(SourceLoc::none(), "frame access without a frame");
                return;
            }
        };
        self.code.push(OP_LOCAL_GET);
        self.code.uleb128(bp as u64);
        if offset != 0 {
            self.code.push(OP_I32_CONST);
            self.code.sleb128(offset as i64);
            self.code.push(OP_I32_ADD);
        }
    }

    fn gen_load(&mut self, ty: &Type) {
        let size = ty.size(PTR_SIZE);
        let (op, align) = if ty.is_flonum() {
            if size == 4 {
                (OP_F32_LOAD, 2)
            } else {
                (OP_F64_LOAD, 3)
            }
        } else {
            let unsigned = ty.is_unsigned();
            match (size, unsigned) {
                (1, false) => (OP_I32_LOAD8_S, 0),
                (1, true) => (OP_I32_LOAD8_U, 0),
                (2, false) => (OP_I32_LOAD16_S, 1),
                (2, true) => (OP_I32_LOAD16_U, 1),
                (8, _) => (OP_I64_LOAD, 3),
                _ => (OP_I32_LOAD, 2),
            }
        };
        self.code.push(op);
        self.code.uleb128(align);
        self.code.uleb128(0);
    }

    fn gen_store(&mut self, ty: &Type) {
        let size = ty.size(PTR_SIZE);
        let (op, align) = if ty.is_flonum() {
            if size == 4 {
                (OP_F32_STORE, 2)
            } else {
                (OP_F64_STORE, 3)
            }
        } else {
            match size {
                1 => (OP_I32_STORE8, 0),
                2 => (OP_I32_STORE16, 1),
                8 => (OP_I64_STORE, 3),
                _ => (OP_I32_STORE, 2),
            }
        };
        self.code.push(op);
        self.code.uleb128(align);
        self.code.uleb128(0);
    }

    fn gen_memory_copy(&mut self) {
        self.code.push(OP_0XFC);
        self.code.uleb128(OPFC_MEMORY_COPY as u64);
        self.code.push(0);
        self.code.push(0);
    }

    // -----------------------------------------------------------------
    // Statements

    fn gen_stmt(&mut self, stmt: &Stmt, is_last: bool) {
        match stmt {
            Stmt::Empty => {}
            Stmt::Expr(e) => self.gen_expr(e, false),
            Stmt::Return { val } => self.gen_return(val.as_ref(), is_last),
            Stmt::Block { stmts, .. } => self.gen_stmts(stmts, is_last),
            Stmt::If {
                cond,
                then_br,
                else_br,
            } => self.gen_if(cond, then_br, else_br.as_deref(), is_last),
            Stmt::Switch { value, body, cases } => self.gen_switch(value, body, cases),
            Stmt::Case { index } => self.gen_case(*index),
            Stmt::While { cond, body } => self.gen_while(cond, body),
            Stmt::DoWhile { body, cond } => self.gen_do_while(body, cond),
            Stmt::For {
                pre,
                cond,
                post,
                body,
            } => self.gen_for(pre.as_deref(), cond.as_ref(), post.as_ref(), body),
            Stmt::Break => self.gen_break(),
            Stmt::Continue => self.gen_continue(),
            Stmt::Label { name, stmt } => {
                self.gen_label(name);
                self.gen_stmt(stmt, is_last);
            }
            Stmt::VarDecl { var, init } => {
                if let Some(WasmLocal::Frame(offset)) = self.locals.get(var).copied() {
                    let func = self.func;
                    if let Some(info) = func.find_var(*var) {
                        if info.ty.is_aggregate() {
                            self.gen_clear_local(offset, info.ty.size(PTR_SIZE) as u32);
                        }
                    }
                }
                if let Some(init) = init {
                    self.gen_stmt(init, false);
                }
            }
            Stmt::Asm { text } => self.gen_asm(text),
            Stmt::Goto { label, loc } => self.gen_goto(label, *loc),
        }
    }

    fn gen_stmts(&mut self, stmts: &[Stmt], is_last: bool) {
        // A label ends a block whose start is the top of the statement
        // list, so a forward goto right before `L:` patches to depth 0.
        // One block opens per top-level label; each closes at its label.
        let label_count = stmts
            .iter()
            .filter(|s| matches!(s, Stmt::Label { .. }))
            .count();
        for _ in 0..label_count {
            self.code.push(OP_BLOCK);
            self.code.push(WT_VOID);
            self.state.cur_depth += 1;
        }
        let len = stmts.len();
        let mut seen = 0usize;
        for (i, stmt) in stmts.iter().enumerate() {
            // While any label block is still open, no statement may flow a
            // value out of it, so nothing counts as last until then.
            if let Stmt::Label { name, stmt: inner } = stmt {
                self.code.push(OP_END);
                self.state.cur_depth -= 1;
                self.gen_label(name);
                seen += 1;
                let last = is_last && i == len - 1 && seen == label_count;
                self.gen_stmt(inner, last);
            } else {
                let last = is_last && i == len - 1 && seen == label_count;
                self.gen_stmt(stmt, last);
            }
        }
    }

    fn gen_clear_local(&mut self, offset: i32, size: u32) {
        if size == 0 {
            return;
        }
        self.gen_bpofs(offset);
        self.code.push(OP_I32_CONST);
        self.code.sleb128(0);
        self.code.push(OP_I32_CONST);
        self.code.sleb128(size as i64);
        self.code.push(OP_0XFC);
        self.code.uleb128(OPFC_MEMORY_FILL as u64);
        self.code.push(0);
    }

    fn gen_return(&mut self, val: Option<&Expr>, is_last: bool) {
        if let Some(val) = val {
            if val.ty.is_aggregate() {
                // Copy through the caller-provided result pointer, and
                // leave that pointer as the value.
                self.code.push(OP_LOCAL_GET);
                self.code.uleb128(0);
                self.gen_expr(val, true);
                self.code.push(OP_I32_CONST);
                self.code.sleb128(val.ty.size(PTR_SIZE) as i64);
                self.gen_memory_copy();
                self.code.push(OP_LOCAL_GET);
                self.code.uleb128(0);
            } else {
                self.gen_expr(val, true);
            }
        }
        if !is_last {
            if self.bp_local.is_some() {
                // Leave through the function-wide block so the epilogue
                // restores the stack pointer.
                debug_assert!(self.state.cur_depth > 0);
                self.code.push(OP_BR);
                self.code.uleb128((self.state.cur_depth - 1) as u64);
            } else {
                self.code.push(OP_RETURN);
            }
        }
    }

    fn gen_if(&mut self, cond: &Expr, then_br: &Stmt, else_br: Option<&Stmt>, is_last: bool) {
        if let Some(truthy) = cond.const_truthy() {
            if truthy {
                self.gen_stmt(then_br, is_last);
            } else if let Some(else_br) = else_br {
                self.gen_stmt(else_br, is_last);
            }
            return;
        }

        let mut wt = WT_VOID;
        if is_last && else_br.is_some() && ends_with_return(then_br) {
            if let Some(e) = else_br {
                if ends_with_return(e) {
                    wt = ret_wtype(&self.func.ty.ret);
                }
            }
        }

        self.gen_cond(cond, true, true);
        self.code.push(OP_IF);
        self.code.push(wt);
        self.state.cur_depth += 1;
        self.gen_stmt(then_br, is_last);
        if let Some(else_br) = else_br {
            self.code.push(OP_ELSE);
            self.gen_stmt(else_br, is_last);
        }
        self.code.push(OP_END);
        self.state.cur_depth -= 1;
    }

    fn gen_while(&mut self, cond: &Expr, body: &Stmt) {
        let mut infinite = false;
        if let Some(truthy) = cond.const_truthy() {
            if !truthy {
                return;
            }
            infinite = true;
        }

        let save_break = self.state.break_depth;
        let save_continue = self.state.continue_depth;
        self.state.break_depth = self.state.cur_depth;
        self.state.continue_depth = self.state.cur_depth + 1;

        self.code.push(OP_BLOCK);
        self.code.push(WT_VOID);
        self.code.push(OP_LOOP);
        self.code.push(WT_VOID);
        self.state.cur_depth += 2;
        if !infinite {
            self.gen_cond_jmp(cond, false, 1);
        }
        self.gen_stmt(body, false);
        self.code.push(OP_BR);
        self.code.uleb128(0);
        self.code.push(OP_END);
        self.code.push(OP_END);
        self.state.cur_depth -= 2;
        self.state.break_depth = save_break;
        self.state.continue_depth = save_continue;
    }

    fn gen_do_while(&mut self, body: &Stmt, cond: &Expr) {
        let (mut infinite, mut no_loop) = (false, false);
        if let Some(truthy) = cond.const_truthy() {
            if truthy {
                infinite = true;
            } else {
                no_loop = true;
            }
        }

        let save_break = self.state.break_depth;
        let save_continue = self.state.continue_depth;
        self.state.break_depth = self.state.cur_depth;
        self.state.continue_depth = self.state.cur_depth + 2;

        self.code.push(OP_BLOCK);
        self.code.push(WT_VOID);
        self.code.push(OP_LOOP);
        self.code.push(WT_VOID);
        self.code.push(OP_BLOCK);
        self.code.push(WT_VOID);
        self.state.cur_depth += 3;
        self.gen_stmt(body, false);
        self.code.push(OP_END);
        self.state.cur_depth -= 1;
        if no_loop {
            self.code.push(OP_BR);
            self.code.uleb128(1);
        } else if infinite {
            self.code.push(OP_BR);
            self.code.uleb128(0);
        } else {
            self.gen_cond_jmp(cond, true, 0);
        }
        self.code.push(OP_END);
        self.code.push(OP_END);
        self.state.cur_depth -= 2;
        self.state.break_depth = save_break;
        self.state.continue_depth = save_continue;
    }

    fn gen_for(
        &mut self,
        pre: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Expr>,
        body: &Stmt,
    ) {
        if let Some(pre) = pre {
            self.gen_stmt(pre, false);
        }
        let infinite = match cond {
            None => true,
            Some(c) => match c.const_truthy() {
                Some(false) => return,
                Some(true) => true,
                None => false,
            },
        };

        let save_break = self.state.break_depth;
        let save_continue = self.state.continue_depth;
        self.state.break_depth = self.state.cur_depth;
        self.state.continue_depth = self.state.cur_depth + 2;

        self.code.push(OP_BLOCK);
        self.code.push(WT_VOID);
        self.code.push(OP_LOOP);
        self.code.push(WT_VOID);
        self.code.push(OP_BLOCK);
        self.code.push(WT_VOID);
        self.state.cur_depth += 3;
        if !infinite {
            if let Some(cond) = cond {
                self.gen_cond_jmp(cond, false, 2);
            }
        }
        self.gen_stmt(body, false);
        self.code.push(OP_END);
        self.state.cur_depth -= 1;
        if let Some(post) = post {
            self.gen_expr(post, false);
        }
        self.code.push(OP_BR);
        self.code.uleb128(0);
        self.code.push(OP_END);
        self.code.push(OP_END);
        self.state.cur_depth -= 2;
        self.state.break_depth = save_break;
        self.state.continue_depth = save_continue;
    }

    fn gen_break(&mut self) {
        debug_assert!(self.state.cur_depth > self.state.break_depth);
        self.code.push(OP_BR);
        self.code
            .uleb128((self.state.cur_depth - self.state.break_depth - 1) as u64);
    }

    fn gen_continue(&mut self) {
        debug_assert!(self.state.cur_depth > self.state.continue_depth);
        self.code.push(OP_BR);
        self.code
            .uleb128((self.state.cur_depth - self.state.continue_depth - 1) as u64);
    }

    fn gen_goto(&mut self, label: &Name, _loc: SourceLoc) {
        self.state.goto_patches.push(GotoPatch {
            label: label.clone(),
            goto_depth: self.state.cur_depth,
            patch_offset: self.code.len(),
        });
        // Placeholder depth, patched when the label is reached.
        self.code.push(OP_BR);
        self.code.uleb128(0);
    }

    fn gen_label(&mut self, name: &Name) {
        let cur_depth = self.state.cur_depth;
        let mut patches = std::mem::take(&mut self.state.goto_patches);
        patches.retain(|patch| {
            if patch.label != *name {
                return true;
            }
            let branch_depth = patch.goto_depth - cur_depth - 1;
            if branch_depth < 0 {
                self.diag.error(
                    SourceLoc::none(),
                    format!("unsupported goto: cannot branch to deeper label '{}'", name),
                );
            } else if branch_depth >= 128 {
                // The placeholder is a single ULEB128 byte.
                self.diag.error(
                    SourceLoc::none(),
                    format!("unsupported goto: branch depth {} too large", branch_depth),
                );
            } else {
                self.code
                    .patch_u8(patch.patch_offset + 1, branch_depth as u8);
            }
            false
        });
        self.state.goto_patches = patches;
    }

    fn gen_asm(&mut self, text: &str) {
        // The wasm flavor of inline asm: comma-separated opcode bytes.
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.parse::<i64>() {
                Ok(op) => self.code.push(op as u8),
                Err(_) => {
                    self.diag
                        .error(SourceLoc::none(), format!("bad asm byte '{}'", part));
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // switch

    fn gen_switch(&mut self, value: &Expr, body: &Stmt, cases: &[CaseInfo]) {
        let save_break = self.state.break_depth;
        self.state.break_depth = self.state.cur_depth;

        // Adjacent case markers share one body block.
        let (block_index, block_count) = squash_cases(body, cases.len());

        self.code.push(OP_BLOCK);
        self.code.push(WT_VOID);
        for _ in 0..block_count {
            self.code.push(OP_BLOCK);
            self.code.push(WT_VOID);
        }
        self.state.cur_depth += block_count as i32 + 1;

        // The dispatch evaluates the value more than once; it must be a
        // variable or a constant (commas are peeled).
        let mut value = value;
        while let ExprKind::Comma { lhs, rhs } = &value.kind {
            self.gen_expr(lhs, false);
            value = &**rhs;
        }
        if !value.is_const() && !matches!(value.kind, ExprKind::Var { .. }) {
            self.diag.error(
                value.loc,
                "switch value must be a variable or constant here",
            );
        }

        let mut default_index = block_count;
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        let mut case_count: i64 = 0;
        for (i, c) in cases.iter().enumerate() {
            match c.value {
                None => default_index = resolve_block(block_index[i]),
                Some(v) => {
                    case_count += 1;
                    min = min.min(v);
                    max = max.max(v);
                }
            }
        }

        // A table pays off when the value range is at most twice as wide
        // as the case count: (max - min + 1) / case_count <= 2, kept in
        // multiplied form so nothing rounds through integer division.
        let vrange = max as i128 - min as i128 + 1;
        if case_count >= 4 && vrange <= 2 * case_count as i128 {
            self.gen_switch_table_jump(value, cases, &block_index, min, max, default_index);
        } else {
            let is_i64 = value.ty.size(PTR_SIZE) > 4;
            for (i, c) in cases.iter().enumerate() {
                let v = match c.value {
                    Some(v) => v,
                    None => continue,
                };
                self.gen_expr(value, true);
                self.code.push(if is_i64 { OP_I64_CONST } else { OP_I32_CONST });
                self.code.sleb128(v);
                self.code.push(if is_i64 { OP_I64_EQ } else { OP_I32_EQ });
                self.code.push(OP_BR_IF);
                self.code.uleb128(resolve_block(block_index[i]) as u64);
            }
            self.code.push(OP_BR);
            self.code.uleb128(default_index as u64);
        }

        self.switch_blocks.push(block_index);
        self.gen_stmt(body, false);
        self.switch_blocks.pop();

        self.code.push(OP_END);
        self.state.cur_depth -= 1;
        debug_assert_eq!(self.state.cur_depth, self.state.break_depth);
        self.state.break_depth = save_break;
    }

    fn gen_switch_table_jump(
        &mut self,
        value: &Expr,
        cases: &[CaseInfo],
        block_index: &[i32],
        min: i64,
        max: i64,
        default_index: usize,
    ) {
        let vrange = (max - min + 1) as usize;
        let mut table = vec![default_index; vrange];
        for (i, c) in cases.iter().enumerate() {
            if let Some(v) = c.value {
                table[(v - min) as usize] = resolve_block(block_index[i]);
            }
        }

        self.gen_expr(value, true);
        let is_i64 = value.ty.size(PTR_SIZE) > 4;
        if min != 0 {
            self.code.push(if is_i64 { OP_I64_CONST } else { OP_I32_CONST });
            self.code.sleb128(min);
            self.code.push(if is_i64 { OP_I64_SUB } else { OP_I32_SUB });
        }
        if is_i64 {
            self.code.push(OP_I32_WRAP_I64);
        }
        self.code.push(OP_BR_TABLE);
        self.code.uleb128(vrange as u64);
        for entry in table {
            self.code.uleb128(entry as u64);
        }
        self.code.uleb128(default_index as u64);
    }

    fn gen_case(&mut self, index: usize) {
        // A case opening a fresh body block closes the previous one; a
        // marker sharing its neighbor's block just falls in.
        let opens = match self.switch_blocks.last() {
            Some(blocks) => blocks.get(index).map_or(false, |&b| b >= 0),
            None => {
                self.diag
                    .error(SourceLoc::none(), "case label outside of switch");
                return;
            }
        };
        if opens {
            self.code.push(OP_END);
            self.state.cur_depth -= 1;
            debug_assert!(self.state.cur_depth >= 0);
        }
    }

    // -----------------------------------------------------------------
    // Conditions

    fn gen_compare_expr(&mut self, kind: BinOp, lhs: &Expr, rhs: &Expr, needval: bool) {
        self.gen_expr(lhs, needval);
        if needval && kind == BinOp::Eq && rhs.is_const() && rhs.ty.is_fixnum() {
            if let ExprKind::Fixnum(0) = rhs.kind {
                self.code.push(if lhs.ty.size(PTR_SIZE) <= 4 {
                    OP_I32_EQZ
                } else {
                    OP_I64_EQZ
                });
                return;
            }
        }
        self.gen_expr(rhs, needval);
        if !needval {
            return;
        }

        let index = if lhs.ty.is_flonum() {
            if lhs.ty.size(PTR_SIZE) >= 8 {
                5
            } else {
                4
            }
        } else {
            (lhs.ty.is_unsigned() as usize) * 2 + (lhs.ty.size(PTR_SIZE) > 4) as usize
        };

        static OP_TABLE: [[u8; 6]; 6] = [
            [OP_I32_EQ, OP_I32_NE, OP_I32_LT_S, OP_I32_LE_S, OP_I32_GE_S, OP_I32_GT_S],
            [OP_I64_EQ, OP_I64_NE, OP_I64_LT_S, OP_I64_LE_S, OP_I64_GE_S, OP_I64_GT_S],
            [OP_I32_EQ, OP_I32_NE, OP_I32_LT_U, OP_I32_LE_U, OP_I32_GE_U, OP_I32_GT_U],
            [OP_I64_EQ, OP_I64_NE, OP_I64_LT_U, OP_I64_LE_U, OP_I64_GE_U, OP_I64_GT_U],
            [OP_F32_EQ, OP_F32_NE, OP_F32_LT, OP_F32_LE, OP_F32_GE, OP_F32_GT],
            [OP_F64_EQ, OP_F64_NE, OP_F64_LT, OP_F64_LE, OP_F64_GE, OP_F64_GT],
        ];
        let col = match kind {
            BinOp::Eq => 0,
            BinOp::Ne => 1,
            BinOp::Lt => 2,
            BinOp::Le => 3,
            BinOp::Ge => 4,
            BinOp::Gt => 5,
            _ => unreachable!("not a comparison"),
        };
        self.code.push(OP_TABLE[index][col]);
    }

    /// Emit `cond` as a boolean equal to `tf`.
    fn gen_cond(&mut self, cond: &Expr, tf: bool, needval: bool) {
        match &cond.kind {
            ExprKind::Fixnum(v) => {
                if needval {
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128(((*v != 0) == tf) as i64);
                }
            }
            ExprKind::Bin { op, lhs, rhs } if op.is_compare() => {
                let mut kind = *op;
                if !tf {
                    kind = complement_compare(kind);
                }
                self.gen_compare_expr(kind, lhs, rhs, needval);
            }
            ExprKind::Bin {
                op: op @ (BinOp::LogAnd | BinOp::LogOr),
                lhs,
                rhs,
            } => {
                let logand = *op == BinOp::LogAnd;
                self.gen_cond(lhs, logand, true);
                self.code.push(OP_IF);
                self.code.push(if needval { WT_I32 } else { WT_VOID });
                self.state.cur_depth += 1;
                self.gen_cond(rhs, tf, needval);
                if needval {
                    self.code.push(OP_ELSE);
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128((tf ^ logand) as i64);
                }
                self.code.push(OP_END);
                self.state.cur_depth -= 1;
            }
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs, false);
                self.gen_cond(rhs, tf, needval);
            }
            _ => {
                // Truthiness of an arbitrary scalar value.
                self.gen_expr(cond, true);
                if !needval {
                    self.code.push(OP_DROP);
                    return;
                }
                if cond.ty.is_flonum() {
                    if cond.ty.size(PTR_SIZE) >= 8 {
                        self.code.push(OP_F64_CONST);
                        self.code.f64(0.0);
                        self.code.push(if tf { OP_F64_NE } else { OP_F64_EQ });
                    } else {
                        self.code.push(OP_F32_CONST);
                        self.code.f32(0.0);
                        self.code.push(if tf { OP_F32_NE } else { OP_F32_EQ });
                    }
                } else {
                    if cond.ty.size(PTR_SIZE) > 4 {
                        self.code.push(OP_I64_EQZ);
                    } else {
                        self.code.push(OP_I32_EQZ);
                    }
                    if tf {
                        self.code.push(OP_I32_EQZ);
                    }
                }
            }
        }
    }

    fn gen_cond_jmp(&mut self, cond: &Expr, tf: bool, depth: u32) {
        self.gen_cond(cond, tf, true);
        self.code.push(OP_BR_IF);
        self.code.uleb128(depth as u64);
    }

    // -----------------------------------------------------------------
    // Expressions

    fn gen_expr(&mut self, expr: &Expr, needval: bool) {
        match &expr.kind {
            ExprKind::Fixnum(v) => {
                if needval {
                    if expr.ty.size(PTR_SIZE) > 4 {
                        self.code.push(OP_I64_CONST);
                        self.code.sleb128(*v);
                    } else {
                        self.code.push(OP_I32_CONST);
                        self.code.sleb128(*v as i32 as i64);
                    }
                }
            }
            ExprKind::Flonum(v) => {
                if needval {
                    if expr.ty.size(PTR_SIZE) == 4 {
                        self.code.push(OP_F32_CONST);
                        self.code.f32(*v as f32);
                    } else {
                        self.code.push(OP_F64_CONST);
                        self.code.f64(*v);
                    }
                }
            }
            ExprKind::Str(bytes) => {
                if needval {
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128(self.me.string_addr(bytes) as i64);
                }
            }
            ExprKind::Var { .. } => {
                if needval {
                    self.gen_var_value(expr);
                }
            }
            ExprKind::Bin { op, lhs, rhs } => {
                if op.is_compare() {
                    self.gen_compare_expr(*op, lhs, rhs, needval);
                } else if matches!(op, BinOp::LogAnd | BinOp::LogOr) {
                    self.gen_cond(expr, true, needval);
                } else {
                    self.gen_arith(expr, *op, lhs, rhs, needval);
                }
            }
            ExprKind::Unary { op, sub } => self.gen_unary(expr, *op, sub, needval),
            ExprKind::Cast { sub } => self.gen_cast(expr, sub, needval),
            ExprKind::Assign { lhs, rhs } => self.gen_assign(lhs, rhs, needval),
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs, false);
                self.gen_expr(rhs, needval);
            }
            ExprKind::Member { .. } => {
                if needval {
                    self.gen_lval(expr);
                    if expr.ty.is_prim() {
                        self.gen_load(&expr.ty);
                    }
                }
            }
            ExprKind::Funcall { func, args } => self.gen_funcall(expr, func, args, needval),
        }
    }

    fn gen_var_value(&mut self, expr: &Expr) {
        let (id, name) = match &expr.kind {
            ExprKind::Var { id, name } => (id, name),
            _ => return,
        };
        if let Some(id) = id {
            match self.locals.get(id).copied() {
                Some(WasmLocal::Local(index)) => {
                    self.code.push(OP_LOCAL_GET);
                    self.code.uleb128(index as u64);
                    return;
                }
                Some(WasmLocal::Frame(offset)) => {
                    self.gen_bpofs(offset);
                    if expr.ty.is_prim() {
                        self.gen_load(&expr.ty);
                    }
                    return;
                }
                None => {}
            }
        }
        // Global scope.
        if matches!(expr.ty, Type::Func(_)) {
            let index = self
                .me
                .func_info
                .get(name)
                .and_then(|i| i.indirect_index)
                .unwrap_or(0);
            if index == 0 {
                self.diag
                    .error(expr.loc, format!("function '{}' has no table slot", name));
            }
            self.code.push(OP_I32_CONST);
            self.code.sleb128(index as i64);
            return;
        }
        match self.me.gvar_info.get(name).map(|g| g.place) {
            Some(GVarPlace::Global(index)) => {
                self.code.push(OP_GLOBAL_GET);
                self.code.uleb128(index as u64);
            }
            Some(GVarPlace::Memory(addr)) => {
                self.code.push(OP_I32_CONST);
                self.code.sleb128(addr as i64);
                if expr.ty.is_prim() {
                    self.gen_load(&expr.ty);
                }
            }
            None => {
                self.diag
                    .error(expr.loc, format!("undefined variable '{}'", name));
                self.code.push(OP_I32_CONST);
                self.code.sleb128(0);
            }
        }
    }

    /// Push the address of an lvalue.
    fn gen_lval(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Var { id, name } => {
                if let Some(id) = id {
                    match self.locals.get(id).copied() {
                        Some(WasmLocal::Frame(offset)) => {
                            self.gen_bpofs(offset);
                            return;
                        }
                        Some(WasmLocal::Local(index)) => {
                            // Aggregates held "in a local" are pointers.
                            if expr.ty.is_aggregate() {
                                self.code.push(OP_LOCAL_GET);
                                self.code.uleb128(index as u64);
                            } else {
                                self.diag.error(
                                    expr.loc,
                                    format!("address taken of register variable '{}'", name),
                                );
                                self.code.push(OP_I32_CONST);
                                self.code.sleb128(0);
                            }
                            return;
                        }
                        None => {}
                    }
                }
                match self.me.gvar_info.get(name).map(|g| g.place) {
                    Some(GVarPlace::Memory(addr)) => {
                        self.code.push(OP_I32_CONST);
                        self.code.sleb128(addr as i64);
                    }
                    _ => {
                        self.diag
                            .error(expr.loc, format!("'{}' has no address", name));
                        self.code.push(OP_I32_CONST);
                        self.code.sleb128(0);
                    }
                }
            }
            ExprKind::Unary {
                op: UnOp::Deref,
                sub,
            } => self.gen_expr(sub, true),
            ExprKind::Member { sub, offset, .. } => {
                self.gen_lval(sub);
                if *offset != 0 {
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128(*offset as i64);
                    self.code.push(OP_I32_ADD);
                }
            }
            ExprKind::Str(bytes) => {
                self.code.push(OP_I32_CONST);
                self.code.sleb128(self.me.string_addr(bytes) as i64);
            }
            _ => {
                self.diag.error(expr.loc, "expression is not assignable");
                self.code.push(OP_I32_CONST);
                self.code.sleb128(0);
            }
        }
    }

    fn gen_arith(&mut self, expr: &Expr, op: BinOp, lhs: &Expr, rhs: &Expr, needval: bool) {
        if !needval {
            self.gen_expr(lhs, false);
            self.gen_expr(rhs, false);
            return;
        }

        // Pointer arithmetic scales by element size (pointers are i32).
        if let Some(elem) = lhs.ty.pointee() {
            if matches!(op, BinOp::Add | BinOp::Sub) && rhs.ty.is_fixnum() {
                let elem_size = elem.size(PTR_SIZE).max(1);
                self.gen_expr(lhs, true);
                self.gen_expr(rhs, true);
                if rhs.ty.size(PTR_SIZE) > 4 {
                    self.code.push(OP_I32_WRAP_I64);
                }
                if elem_size != 1 {
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128(elem_size as i64);
                    self.code.push(OP_I32_MUL);
                }
                self.code
                    .push(if op == BinOp::Add { OP_I32_ADD } else { OP_I32_SUB });
                return;
            }
            if op == BinOp::Sub && rhs.ty.pointee().is_some() {
                let elem_size = elem.size(PTR_SIZE).max(1);
                self.gen_expr(lhs, true);
                self.gen_expr(rhs, true);
                self.code.push(OP_I32_SUB);
                if elem_size != 1 {
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128(elem_size as i64);
                    self.code.push(OP_I32_DIV_S);
                }
                return;
            }
        }

        self.gen_expr(lhs, true);
        self.gen_expr(rhs, true);

        let ty = &expr.ty;
        let opcode = if ty.is_flonum() {
            let f64_ = ty.size(PTR_SIZE) >= 8;
            match op {
                BinOp::Add => if f64_ { OP_F64_ADD } else { OP_F32_ADD },
                BinOp::Sub => if f64_ { OP_F64_SUB } else { OP_F32_SUB },
                BinOp::Mul => if f64_ { OP_F64_MUL } else { OP_F32_MUL },
                BinOp::Div => if f64_ { OP_F64_DIV } else { OP_F32_DIV },
                _ => {
                    self.diag.error(expr.loc, "invalid float operation");
                    return;
                }
            }
        } else {
            let i64_ = ty.size(PTR_SIZE) > 4;
            let unsigned = ty.is_unsigned();
            match (op, i64_, unsigned) {
                (BinOp::Add, false, _) => OP_I32_ADD,
                (BinOp::Add, true, _) => OP_I64_ADD,
                (BinOp::Sub, false, _) => OP_I32_SUB,
                (BinOp::Sub, true, _) => OP_I64_SUB,
                (BinOp::Mul, false, _) => OP_I32_MUL,
                (BinOp::Mul, true, _) => OP_I64_MUL,
                (BinOp::Div, false, false) => OP_I32_DIV_S,
                (BinOp::Div, false, true) => OP_I32_DIV_U,
                (BinOp::Div, true, false) => OP_I64_DIV_S,
                (BinOp::Div, true, true) => OP_I64_DIV_U,
                (BinOp::Mod, false, false) => OP_I32_REM_S,
                (BinOp::Mod, false, true) => OP_I32_REM_U,
                (BinOp::Mod, true, false) => OP_I64_REM_S,
                (BinOp::Mod, true, true) => OP_I64_REM_U,
                (BinOp::BitAnd, false, _) => OP_I32_AND,
                (BinOp::BitAnd, true, _) => OP_I64_AND,
                (BinOp::BitOr, false, _) => OP_I32_OR,
                (BinOp::BitOr, true, _) => OP_I64_OR,
                (BinOp::BitXor, false, _) => OP_I32_XOR,
                (BinOp::BitXor, true, _) => OP_I64_XOR,
                (BinOp::LShift, false, _) => OP_I32_SHL,
                (BinOp::LShift, true, _) => OP_I64_SHL,
                (BinOp::RShift, false, false) => OP_I32_SHR_S,
                (BinOp::RShift, false, true) => OP_I32_SHR_U,
                (BinOp::RShift, true, false) => OP_I64_SHR_S,
                (BinOp::RShift, true, true) => OP_I64_SHR_U,
                _ => {
                    self.diag.error(expr.loc, "invalid integer operation");
                    return;
                }
            }
        };
        self.code.push(opcode);
    }

    fn gen_unary(&mut self, expr: &Expr, op: UnOp, sub: &Expr, needval: bool) {
        match op {
            UnOp::Ref => {
                if needval {
                    self.gen_lval(sub);
                } else {
                    self.gen_expr(sub, false);
                }
            }
            UnOp::Deref => {
                self.gen_expr(sub, needval);
                // Dereferencing a function pointer yields the designator
                // (the table index) itself; only data loads from memory.
                if needval && expr.ty.is_prim() && !matches!(expr.ty, Type::Func(_)) {
                    self.gen_load(&expr.ty);
                }
            }
            UnOp::Neg => {
                if !needval {
                    return self.gen_expr(sub, false);
                }
                if expr.ty.is_flonum() {
                    self.gen_expr(sub, true);
                    self.code.push(if expr.ty.size(PTR_SIZE) >= 8 {
                        OP_F64_NEG
                    } else {
                        OP_F32_NEG
                    });
                } else if expr.ty.size(PTR_SIZE) > 4 {
                    self.code.push(OP_I64_CONST);
                    self.code.sleb128(0);
                    self.gen_expr(sub, true);
                    self.code.push(OP_I64_SUB);
                } else {
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128(0);
                    self.gen_expr(sub, true);
                    self.code.push(OP_I32_SUB);
                }
            }
            UnOp::BitNot => {
                if !needval {
                    return self.gen_expr(sub, false);
                }
                self.gen_expr(sub, true);
                if expr.ty.size(PTR_SIZE) > 4 {
                    self.code.push(OP_I64_CONST);
                    self.code.sleb128(-1);
                    self.code.push(OP_I64_XOR);
                } else {
                    self.code.push(OP_I32_CONST);
                    self.code.sleb128(-1);
                    self.code.push(OP_I32_XOR);
                }
            }
        }
    }

    fn gen_cast(&mut self, expr: &Expr, sub: &Expr, needval: bool) {
        self.gen_expr(sub, needval);
        if !needval || matches!(expr.ty, Type::Void) {
            if needval {
                self.code.push(OP_DROP);
            }
            return;
        }
        let from = &sub.ty;
        let to = &expr.ty;
        match (from.is_flonum(), to.is_flonum()) {
            (false, false) => {
                let fs = from.size(PTR_SIZE);
                let ts = to.size(PTR_SIZE);
                if fs <= 4 && ts > 4 {
                    self.code.push(if from.is_unsigned() {
                        OP_I64_EXTEND_I32_U
                    } else {
                        OP_I64_EXTEND_I32_S
                    });
                } else if fs > 4 && ts <= 4 {
                    self.code.push(OP_I32_WRAP_I64);
                }
                // Narrowing re-extends in i32 by the target's signedness;
                // widening within i32 is already canonical.
                if ts < 4 && ts < fs {
                    self.narrow_i32(ts, to.is_unsigned());
                }
            }
            (false, true) => {
                let f64_ = to.size(PTR_SIZE) >= 8;
                let from64 = from.size(PTR_SIZE) > 4;
                let unsigned = from.is_unsigned();
                self.code.push(match (f64_, from64, unsigned) {
                    (false, false, false) => OP_F32_CONVERT_I32_S,
                    (false, false, true) => OP_F32_CONVERT_I32_U,
                    (false, true, false) => OP_F32_CONVERT_I64_S,
                    (false, true, true) => OP_F32_CONVERT_I64_U,
                    (true, false, false) => OP_F64_CONVERT_I32_S,
                    (true, false, true) => OP_F64_CONVERT_I32_U,
                    (true, true, false) => OP_F64_CONVERT_I64_S,
                    (true, true, true) => OP_F64_CONVERT_I64_U,
                });
            }
            (true, false) => {
                let from64 = from.size(PTR_SIZE) >= 8;
                let to64 = to.size(PTR_SIZE) > 4;
                let unsigned = to.is_unsigned();
                self.code.push(match (to64, from64, unsigned) {
                    (false, false, false) => OP_I32_TRUNC_F32_S,
                    (false, false, true) => OP_I32_TRUNC_F32_U,
                    (false, true, false) => OP_I32_TRUNC_F64_S,
                    (false, true, true) => OP_I32_TRUNC_F64_U,
                    (true, false, false) => OP_I64_TRUNC_F32_S,
                    (true, false, true) => OP_I64_TRUNC_F32_U,
                    (true, true, false) => OP_I64_TRUNC_F64_S,
                    (true, true, true) => OP_I64_TRUNC_F64_U,
                });
                if to.size(PTR_SIZE) < 4 {
                    self.narrow_i32(to.size(PTR_SIZE), to.is_unsigned());
                }
            }
            (true, true) => {
                let fs = from.size(PTR_SIZE);
                let ts = to.size(PTR_SIZE);
                if fs < ts {
                    self.code.push(OP_F64_PROMOTE_F32);
                } else if fs > ts {
                    self.code.push(OP_F32_DEMOTE_F64);
                }
            }
        }
    }

    /// Re-extend an i32 on the stack down to a narrower integer width.
    fn narrow_i32(&mut self, size: usize, unsigned: bool) {
        match (size, unsigned) {
            (1, false) => self.code.push(OP_I32_EXTEND8_S),
            (2, false) => self.code.push(OP_I32_EXTEND16_S),
            (1, true) => {
                self.code.push(OP_I32_CONST);
                self.code.sleb128(0xff);
                self.code.push(OP_I32_AND);
            }
            (2, true) => {
                self.code.push(OP_I32_CONST);
                self.code.sleb128(0xffff);
                self.code.push(OP_I32_AND);
            }
            _ => {}
        }
    }

    fn gen_assign(&mut self, lhs: &Expr, rhs: &Expr, needval: bool) {
        if let ExprKind::Var { id: Some(id), .. } = &lhs.kind {
            if let Some(WasmLocal::Local(index)) = self.locals.get(id).copied() {
                if lhs.ty.is_prim() {
                    self.gen_expr(rhs, true);
                    self.code
                        .push(if needval { OP_LOCAL_TEE } else { OP_LOCAL_SET });
                    self.code.uleb128(index as u64);
                    return;
                }
            }
        }
        if let ExprKind::Var { id: None, name } = &lhs.kind {
            if let Some(GVarPlace::Global(index)) = self.me.gvar_info.get(name).map(|g| g.place)
            {
                self.gen_expr(rhs, true);
                self.code.push(OP_GLOBAL_SET);
                self.code.uleb128(index as u64);
                if needval {
                    self.code.push(OP_GLOBAL_GET);
                    self.code.uleb128(index as u64);
                }
                return;
            }
        }

        if lhs.ty.is_aggregate() {
            self.gen_lval(lhs);
            self.gen_expr(rhs, true);
            self.code.push(OP_I32_CONST);
            self.code.sleb128(lhs.ty.size(PTR_SIZE) as i64);
            self.gen_memory_copy();
            if needval {
                self.gen_lval(lhs);
            }
            return;
        }

        self.gen_lval(lhs);
        self.gen_expr(rhs, true);
        self.gen_store(&lhs.ty);
        if needval {
            // Reading the slot back avoids a scratch local; lvalues reach
            // here in simple (side-effect free) shapes.
            self.gen_lval(lhs);
            self.gen_load(&lhs.ty);
        }
    }

    // -----------------------------------------------------------------
    // Calls

    fn gen_funcall(&mut self, expr: &Expr, func: &Expr, args: &[Expr], needval: bool) {
        if let ExprKind::Var { name, .. } = &func.kind {
            match &**name {
                "__builtin_va_start" => return self.gen_builtin_va_start(expr, args),
                "__builtin_va_end" => return,
                _ => {}
            }
        }

        let ft = match func.ty.func_type() {
            Some(ft) => ft.clone(),
            None => {
                self.diag.error(expr.loc, "call of a non-function");
                return;
            }
        };

        // This call's slice of the outgoing area, sized by the pre-scan.
        let area_base = self
            .call_areas
            .get(self.call_counter)
            .copied()
            .unwrap_or(-(self.frame_size as i32));
        self.call_counter += 1;
        let mut area_cursor = area_base;

        let ret_aggregate = ft.ret.is_aggregate();
        if ret_aggregate {
            // Hidden result pointer into our frame.
            let size = align_up(ft.ret.size(PTR_SIZE) as u32, 8) as i32;
            self.gen_bpofs(area_cursor);
            area_cursor += size;
        }

        let named = ft.params.len();
        for (i, arg) in args.iter().enumerate() {
            if i >= named && ft.vaargs {
                break; // packed below
            }
            if arg.ty.is_aggregate() {
                // By-value means the callee sees a private copy.
                let size = arg.ty.size(PTR_SIZE) as u32;
                self.gen_bpofs(area_cursor);
                self.gen_expr(arg, true);
                self.code.push(OP_I32_CONST);
                self.code.sleb128(size as i64);
                self.gen_memory_copy();
                self.gen_bpofs(area_cursor);
                area_cursor += align_up(size, 8) as i32;
            } else {
                self.gen_expr(arg, true);
            }
        }

        if ft.vaargs {
            // Pack the variadic tail into the frame and pass its address.
            let va_base = area_cursor;
            for arg in args.iter().skip(named) {
                self.gen_bpofs(area_cursor);
                self.gen_expr(arg, true);
                self.gen_store(&arg.ty);
                area_cursor += 8;
            }
            self.gen_bpofs(va_base);
        }

        match &func.kind {
            ExprKind::Var { name, id: None } if matches!(func.ty, Type::Func(_)) => {
                let index = match self.me.func_info.get(name) {
                    Some(info) => info.index,
                    None => {
                        self.diag
                            .error(expr.loc, format!("undefined function '{}'", name));
                        return;
                    }
                };
                self.code.push(OP_CALL);
                self.code.uleb128(index as u64);
            }
            _ => {
                // Function pointers are table indices.
                self.gen_expr(func, true);
                let type_index = self.me.type_index_of(func_sig(&ft));
                self.code.push(OP_CALL_INDIRECT);
                self.code.uleb128(type_index as u64);
                self.code.uleb128(0);
            }
        }

        let has_result = ret_aggregate || !matches!(ft.ret, Type::Void);
        if has_result && !needval {
            self.code.push(OP_DROP);
        }
    }

    fn gen_builtin_va_start(&mut self, expr: &Expr, args: &[Expr]) {
        let va_param = match self.va_param {
            Some(p) => p,
            None => {
                self.diag
                    .error(expr.loc, "va_start outside of a variadic function");
                return;
            }
        };
        if args.len() != 2 {
            self.diag.error(expr.loc, "va_start expects two arguments");
            return;
        }
        // ap = <the hidden variadic-pack pointer>; assignment semantics.
        if let ExprKind::Var { id: Some(id), .. } = &args[0].kind {
            if let Some(WasmLocal::Local(index)) = self.locals.get(id).copied() {
                self.code.push(OP_LOCAL_GET);
                self.code.uleb128(va_param as u64);
                self.code.push(OP_LOCAL_SET);
                self.code.uleb128(index as u64);
                return;
            }
        }
        self.gen_lval(&args[0]);
        self.code.push(OP_LOCAL_GET);
        self.code.uleb128(va_param as u64);
        self.gen_store(&args[0].ty);
    }
}

fn ret_wtype(ret: &Type) -> u8 {
    match ret {
        Type::Void => WT_VOID,
        t if t.is_aggregate() => WT_I32,
        t => to_wtype(t),
    }
}

fn complement_compare(op: BinOp) -> BinOp {
    match op {
        BinOp::Eq => BinOp::Ne,
        BinOp::Ne => BinOp::Eq,
        BinOp::Lt => BinOp::Ge,
        BinOp::Le => BinOp::Gt,
        BinOp::Ge => BinOp::Lt,
        BinOp::Gt => BinOp::Le,
        other => other,
    }
}

/// Does every path through `stmt` end in a return?
fn ends_with_return(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return { .. } => true,
        Stmt::Block { stmts, .. } => stmts.last().map_or(false, ends_with_return),
        Stmt::If {
            then_br, else_br, ..
        } => {
            ends_with_return(then_br)
                && else_br.as_deref().map_or(false, ends_with_return)
        }
        Stmt::Label { stmt, .. } => ends_with_return(stmt),
        _ => false,
    }
}

/// Assign one body block per distinct case body: consecutive markers with
/// nothing between them share a block (`~index` marks the sharing ones).
fn squash_cases(body: &Stmt, ncases: usize) -> (Vec<i32>, usize) {
    let mut indices = vec![0i32; ncases];
    let mut counter: i32 = -1;
    let mut prev_was_marker = false;

    fn walk(
        stmt: &Stmt,
        indices: &mut [i32],
        counter: &mut i32,
        prev_was_marker: &mut bool,
    ) {
        match stmt {
            Stmt::Case { index } => {
                if *prev_was_marker && *counter >= 0 {
                    indices[*index] = !*counter;
                } else {
                    *counter += 1;
                    indices[*index] = *counter;
                }
                *prev_was_marker = true;
            }
            Stmt::Block { stmts, .. } => {
                for s in stmts {
                    walk(s, indices, counter, prev_was_marker);
                }
            }
            Stmt::Label { stmt, .. } => {
                *prev_was_marker = false;
                walk(stmt, indices, counter, prev_was_marker);
            }
            _ => *prev_was_marker = false,
        }
    }
    walk(body, &mut indices, &mut counter, &mut prev_was_marker);
    (indices, (counter + 1).max(0) as usize)
}

fn resolve_block(index: i32) -> usize {
    if index < 0 {
        !index as usize
    } else {
        index as usize
    }
}

/// Pre-measure the outgoing frame bytes each call site needs, walking in
/// the exact order code generation will — including the branches constant
/// conditions make the generator skip, or the counters would drift.
fn measure_stmt(stmt: &Stmt, areas: &mut Vec<u32>) {
    match stmt {
        Stmt::Expr(e) => measure_expr(e, areas),
        Stmt::Block { stmts, .. } => stmts.iter().for_each(|s| measure_stmt(s, areas)),
        Stmt::If {
            cond,
            then_br,
            else_br,
        } => match cond.const_truthy() {
            Some(true) => measure_stmt(then_br, areas),
            Some(false) => {
                if let Some(e) = else_br {
                    measure_stmt(e, areas);
                }
            }
            None => {
                measure_expr(cond, areas);
                measure_stmt(then_br, areas);
                if let Some(e) = else_br {
                    measure_stmt(e, areas);
                }
            }
        },
        Stmt::Switch { value, body, .. } => {
            measure_expr(value, areas);
            measure_stmt(body, areas);
        }
        Stmt::While { cond, body } => match cond.const_truthy() {
            Some(false) => {}
            Some(true) => measure_stmt(body, areas),
            None => {
                measure_expr(cond, areas);
                measure_stmt(body, areas);
            }
        },
        Stmt::DoWhile { body, cond } => {
            measure_stmt(body, areas);
            if cond.const_truthy().is_none() {
                measure_expr(cond, areas);
            }
        }
        Stmt::For {
            pre,
            cond,
            post,
            body,
        } => {
            if let Some(p) = pre {
                measure_stmt(p, areas);
            }
            match cond.as_ref().map(|c| c.const_truthy()) {
                Some(Some(false)) => return, // loop never entered
                Some(None) => {
                    if let Some(c) = cond {
                        measure_expr(c, areas);
                    }
                }
                _ => {}
            }
            measure_stmt(body, areas);
            if let Some(p) = post {
                measure_expr(p, areas);
            }
        }
        Stmt::Label { stmt, .. } => measure_stmt(stmt, areas),
        Stmt::Return { val } => {
            if let Some(v) = val {
                measure_expr(v, areas);
            }
        }
        Stmt::VarDecl { init, .. } => {
            if let Some(i) = init {
                measure_stmt(i, areas);
            }
        }
        _ => {}
    }
}

fn measure_expr(expr: &Expr, areas: &mut Vec<u32>) {
    match &expr.kind {
        ExprKind::Funcall { func, args } => {
            // The outer call reserves its slice before the arguments are
            // measured, matching the emission counter.
            let mut size = 0u32;
            if let Some(ft) = func.ty.func_type() {
                if ft.ret.is_aggregate() {
                    size += align_up(ft.ret.size(PTR_SIZE) as u32, 8);
                }
                let named = ft.params.len();
                for (i, arg) in args.iter().enumerate() {
                    if i >= named && ft.vaargs {
                        size += 8;
                    } else if arg.ty.is_aggregate() {
                        size += align_up(arg.ty.size(PTR_SIZE) as u32, 8);
                    }
                }
            }
            areas.push(size);
            measure_expr(func, areas);
            for arg in args {
                measure_expr(arg, areas);
            }
        }
        ExprKind::Bin { lhs, rhs, .. }
        | ExprKind::Assign { lhs, rhs }
        | ExprKind::Comma { lhs, rhs } => {
            measure_expr(lhs, areas);
            measure_expr(rhs, areas);
        }
        ExprKind::Unary { sub, .. } | ExprKind::Cast { sub } => measure_expr(sub, areas),
        ExprKind::Member { sub, .. } => measure_expr(sub, areas),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squash_shares_adjacent_markers() {
        // switch body: case0: case1: stmt; case2: stmt;
        let body = Stmt::block(vec![
            Stmt::Case { index: 0 },
            Stmt::Case { index: 1 },
            Stmt::Expr(Expr::fixnum(1)),
            Stmt::Case { index: 2 },
            Stmt::Expr(Expr::fixnum(2)),
        ]);
        let (indices, count) = squash_cases(&body, 3);
        assert_eq!(count, 2);
        assert_eq!(indices[0], 0);
        assert_eq!(indices[1], !0);
        assert_eq!(indices[2], 1);
        assert_eq!(resolve_block(indices[1]), 0);
    }

    #[test]
    fn return_coverage() {
        let ret = Stmt::Return { val: None };
        assert!(ends_with_return(&ret));
        let both = Stmt::If {
            cond: Expr::fixnum(1),
            then_br: Box::new(Stmt::Return { val: None }),
            else_br: Some(Box::new(Stmt::Return { val: None })),
        };
        assert!(ends_with_return(&both));
        let one = Stmt::If {
            cond: Expr::fixnum(1),
            then_br: Box::new(Stmt::Return { val: None }),
            else_br: None,
        };
        assert!(!ends_with_return(&one));
    }
}
