//! Whole-module assembly: index spaces, linear memory layout, and the
//! final section stream.
//!
//! Index layout follows the usual linking conventions: imported functions
//! occupy the low function indices, defined functions follow in
//! declaration order. Linear memory keeps data segments at low addresses
//! and the shadow stack grows downward from the top, its current position
//! held in the mutable `__stack_pointer` global. The indirect-call table
//! starts at slot 1 so a null function pointer stays invalid.

use std::collections::HashMap;

use crate::code_translator::FuncTranslator;
use crate::opcodes::*;
use crate::state::CodeStream;
use crate::WasmResult;
use chert_ast::{
    Declaration, Diagnostics, Expr, ExprKind, FuncFlags, FuncType, GlobalVar, Initializer,
    Module, Name, Stmt, Storage, Type, UnOp,
};

/// Shadow stack alignment in bytes.
pub const STACK_ALIGN: u32 = 16;
/// Default shadow stack size.
pub const DEFAULT_STACK_SIZE: u32 = 8 * 1024;
/// First usable indirect-table slot (0 stays null).
pub const INDIRECT_FUNCTION_TABLE_START_INDEX: u32 = 1;

const PAGE_SIZE: u32 = 65536;

/// Pointer size on wasm32.
pub(crate) const PTR_SIZE: usize = 4;

/// Map a C type to its wasm value type byte.
pub(crate) fn to_wtype(ty: &Type) -> u8 {
    match ty {
        Type::Flonum(k) if k.size() == 4 => WT_F32,
        Type::Flonum(_) => WT_F64,
        Type::Fixnum { kind, .. } if kind.size() > 4 => WT_I64,
        // Pointers, aggregates (as addresses) and small integers.
        _ => WT_I32,
    }
}

/// A deduplicated function signature.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct FuncSig {
    pub params: Vec<u8>,
    pub results: Vec<u8>,
}

/// Build the wasm signature of a C function type.
pub(crate) fn func_sig(ft: &FuncType) -> FuncSig {
    let mut params = Vec::new();
    let mut results = Vec::new();
    if ft.ret.is_aggregate() {
        // Hidden result pointer, also returned for chaining.
        params.push(WT_I32);
        results.push(WT_I32);
    } else if !matches!(ft.ret, Type::Void) {
        results.push(to_wtype(&ft.ret));
    }
    for p in &ft.params {
        params.push(to_wtype(p));
    }
    if ft.vaargs {
        params.push(WT_I32); // pointer to the packed variadic arguments
    }
    FuncSig { params, results }
}

/// Everything the code translator needs to know about one function.
#[derive(Clone, Debug)]
pub(crate) struct FuncInfo {
    pub index: u32,
    pub type_index: u32,
    pub import: bool,
    pub export: bool,
    pub indirect_index: Option<u32>,
}

/// Where a global variable ended up.
#[derive(Clone, Copy, Debug)]
pub(crate) enum GVarPlace {
    /// A wasm global, by index.
    Global(u32),
    /// Linear memory, by address.
    Memory(u32),
}

#[derive(Clone, Debug)]
pub(crate) struct GVarInfo {
    pub place: GVarPlace,
    pub ty: Type,
}

/// Emits one translation unit as a complete WebAssembly module.
pub struct ModuleEmitter {
    import_module_name: String,
    stack_size: u32,
    pub(crate) func_info: HashMap<Name, FuncInfo>,
    func_order: Vec<Name>,
    types: Vec<FuncSig>,
    pub(crate) gvar_info: HashMap<Name, GVarInfo>,
    wasm_globals: Vec<(u8, i64, f64)>, // (wt, int init, float init)
    data_segments: Vec<(u32, Vec<u8>)>,
    data_end: u32,
    string_addrs: HashMap<Vec<u8>, u32>,
    indirect_count: u32,
    start_funcs: Vec<u32>,
    codes: Vec<Vec<u8>>, // per defined function, in order
}

impl ModuleEmitter {
    /// Create an emitter importing unresolved functions from
    /// `import_module_name`.
    pub fn new(import_module_name: &str) -> ModuleEmitter {
        ModuleEmitter {
            import_module_name: import_module_name.to_string(),
            stack_size: DEFAULT_STACK_SIZE,
            func_info: HashMap::new(),
            func_order: Vec::new(),
            types: Vec::new(),
            gvar_info: HashMap::new(),
            wasm_globals: Vec::new(),
            data_segments: Vec::new(),
            data_end: 8, // address 0 stays null; leave a little headroom
            string_addrs: HashMap::new(),
            indirect_count: 0,
            start_funcs: Vec::new(),
            codes: Vec::new(),
        }
    }

    /// Translate and assemble the whole module.
    pub fn emit(mut self, module: &Module, diag: &mut Diagnostics) -> WasmResult<Vec<u8>> {
        self.traverse(module);
        self.codegen(module, diag)?;
        Ok(self.write())
    }

    pub(crate) fn type_index_of(&mut self, sig: FuncSig) -> u32 {
        if let Some(i) = self.types.iter().position(|t| *t == sig) {
            return i as u32;
        }
        self.types.push(sig);
        self.types.len() as u32 - 1
    }

    /// Address of an interned string literal.
    pub(crate) fn string_addr(&self, bytes: &[u8]) -> u32 {
        self.string_addrs.get(bytes).copied().unwrap_or(0)
    }

    fn alloc_data(&mut self, size: u32, align: u32) -> u32 {
        let align = align.max(1);
        self.data_end = (self.data_end + align - 1) & !(align - 1);
        let addr = self.data_end;
        self.data_end += size.max(1);
        addr
    }

    fn register_gvar(&mut self, gvar: &GlobalVar) {
        if self.gvar_info.contains_key(&gvar.name) {
            return;
        }
        let prim = gvar.ty.is_prim();
        let in_memory = !prim || gvar.storage.contains(Storage::REF_TAKEN);
        let place = if in_memory {
            let size = gvar.ty.size(PTR_SIZE) as u32;
            let align = gvar.ty.align(PTR_SIZE) as u32;
            let addr = self.alloc_data(size, align);
            if let Some(init) = &gvar.init {
                let mut bytes = Vec::new();
                flatten_initializer(init, &gvar.ty, &mut bytes);
                if bytes.iter().any(|&b| b != 0) {
                    self.data_segments.push((addr, bytes));
                }
            }
            GVarPlace::Memory(addr)
        } else {
            let wt = to_wtype(&gvar.ty);
            let (ival, fval) = match &gvar.init {
                Some(Initializer::Fixnum(v)) => (*v, 0.0),
                Some(Initializer::Flonum(v)) => (0, *v),
                _ => (0, 0.0),
            };
            // Slot 0 is the stack pointer, appended at write time.
            let index = self.wasm_globals.len() as u32 + 1;
            self.wasm_globals.push((wt, ival, fval));
            GVarPlace::Global(index)
        };
        self.gvar_info.insert(
            gvar.name.clone(),
            GVarInfo {
                place,
                ty: gvar.ty.clone(),
            },
        );
    }

    /// First pass: build the function/global index spaces, intern strings,
    /// and find address-taken functions.
    fn traverse(&mut self, module: &Module) {
        // Functions with bodies come after every import, so collect the
        // import set first.
        let mut defined: Vec<&chert_ast::Function> = Vec::new();
        let mut imports: Vec<&chert_ast::Function> = Vec::new();
        for decl in &module.decls {
            match decl {
                Declaration::DefFun(func) => {
                    if func.body.is_some() {
                        defined.push(func);
                    } else if !self.func_info.contains_key(&func.name)
                        && defined.iter().all(|f| f.name != func.name)
                    {
                        imports.push(func);
                    }
                }
                Declaration::VarDef(gvar) => self.register_gvar(gvar),
            }
        }
        imports.retain(|f| defined.iter().all(|d| d.name != f.name));

        let mut index = 0;
        for func in &imports {
            let sig = func_sig(&func.ty);
            let type_index = self.type_index_of(sig);
            self.func_info.insert(
                func.name.clone(),
                FuncInfo {
                    index,
                    type_index,
                    import: true,
                    export: false,
                    indirect_index: None,
                },
            );
            self.func_order.push(func.name.clone());
            index += 1;
        }
        for func in &defined {
            let sig = func_sig(&func.ty);
            let type_index = self.type_index_of(sig);
            self.func_info.insert(
                func.name.clone(),
                FuncInfo {
                    index,
                    type_index,
                    import: false,
                    export: !func.storage.contains(Storage::STATIC),
                    indirect_index: None,
                },
            );
            self.func_order.push(func.name.clone());
            if func.flags.contains(FuncFlags::CONSTRUCTOR) {
                self.start_funcs.push(index);
            }
            index += 1;
        }

        // Literals and function addresses hide inside expressions.
        for decl in &module.decls {
            if let Declaration::DefFun(func) = decl {
                if let Some(body) = &func.body {
                    self.scan_stmt(body);
                }
            }
        }
    }

    fn intern_string(&mut self, bytes: &[u8]) {
        if self.string_addrs.contains_key(bytes) {
            return;
        }
        let addr = self.alloc_data(bytes.len() as u32, 1);
        self.data_segments.push((addr, bytes.to_vec()));
        self.string_addrs.insert(bytes.to_vec(), addr);
    }

    fn take_function_address(&mut self, name: &Name) {
        if let Some(info) = self.func_info.get_mut(name) {
            if info.indirect_index.is_none() {
                info.indirect_index =
                    Some(INDIRECT_FUNCTION_TABLE_START_INDEX + self.indirect_count);
                self.indirect_count += 1;
            }
        }
    }

    fn scan_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Str(bytes) => self.intern_string(bytes),
            ExprKind::Var { id: None, name } if matches!(expr.ty, Type::Func(_)) => {
                // Reaching here outside a direct call position means the
                // function's address escapes; scan_funcall skips callees.
                self.take_function_address(name);
            }
            ExprKind::Bin { lhs, rhs, .. } => {
                self.scan_expr(lhs);
                self.scan_expr(rhs);
            }
            ExprKind::Assign { lhs, rhs } | ExprKind::Comma { lhs, rhs } => {
                self.scan_expr(lhs);
                self.scan_expr(rhs);
            }
            ExprKind::Unary { op, sub } => {
                if *op == UnOp::Ref {
                    if let ExprKind::Var { id: None, name } = &sub.kind {
                        if matches!(sub.ty, Type::Func(_)) {
                            self.take_function_address(name);
                            return;
                        }
                    }
                }
                self.scan_expr(sub);
            }
            ExprKind::Cast { sub } => self.scan_expr(sub),
            ExprKind::Member { sub, .. } => self.scan_expr(sub),
            ExprKind::Funcall { func, args } => {
                // The callee of a direct call is not an escape.
                match &func.kind {
                    ExprKind::Var { id: None, .. } if matches!(func.ty, Type::Func(_)) => {}
                    _ => self.scan_expr(func),
                }
                for arg in args {
                    self.scan_expr(arg);
                }
            }
            ExprKind::Fixnum(_) | ExprKind::Flonum(_) | ExprKind::Var { .. } => {}
        }
    }

    fn scan_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(e) => self.scan_expr(e),
            Stmt::Block { stmts, .. } => stmts.iter().for_each(|s| self.scan_stmt(s)),
            Stmt::If {
                cond,
                then_br,
                else_br,
            } => {
                self.scan_expr(cond);
                self.scan_stmt(then_br);
                if let Some(e) = else_br {
                    self.scan_stmt(e);
                }
            }
            Stmt::Switch { value, body, .. } => {
                self.scan_expr(value);
                self.scan_stmt(body);
            }
            Stmt::While { cond, body } => {
                self.scan_expr(cond);
                self.scan_stmt(body);
            }
            Stmt::DoWhile { body, cond } => {
                self.scan_stmt(body);
                self.scan_expr(cond);
            }
            Stmt::For {
                pre,
                cond,
                post,
                body,
            } => {
                if let Some(p) = pre {
                    self.scan_stmt(p);
                }
                if let Some(c) = cond {
                    self.scan_expr(c);
                }
                if let Some(p) = post {
                    self.scan_expr(p);
                }
                self.scan_stmt(body);
            }
            Stmt::Label { stmt, .. } => self.scan_stmt(stmt),
            Stmt::Return { val } => {
                if let Some(v) = val {
                    self.scan_expr(v);
                }
            }
            Stmt::VarDecl { init, .. } => {
                if let Some(i) = init {
                    self.scan_stmt(i);
                }
            }
            _ => {}
        }
    }

    /// Second pass: translate every defined function body.
    fn codegen(&mut self, module: &Module, diag: &mut Diagnostics) -> WasmResult<()> {
        for decl in &module.decls {
            if let Declaration::DefFun(func) = decl {
                if func.body.is_none() {
                    continue;
                }
                let code = FuncTranslator::new(self, func, diag).translate()?;
                self.codes.push(code);
            }
        }
        Ok(())
    }

    fn section(out: &mut CodeStream, id: u8, payload: CodeStream) {
        out.push(id);
        out.uleb128(payload.len() as u64);
        out.extend(payload.bytes());
    }

    /// Assemble the final byte stream.
    fn write(mut self) -> Vec<u8> {
        // Several constructors collapse into one synthesized init thunk
        // that calls each in order and becomes the start function.
        if self.start_funcs.len() > 1 {
            let sig = FuncSig {
                params: Vec::new(),
                results: Vec::new(),
            };
            let type_index = self.type_index_of(sig);
            let index = self.func_order.len() as u32;
            let name: Name = "__chert_call_ctors".into();
            self.func_info.insert(
                name.clone(),
                FuncInfo {
                    index,
                    type_index,
                    import: false,
                    export: false,
                    indirect_index: None,
                },
            );
            self.func_order.push(name);
            let mut body = CodeStream::new();
            body.uleb128(0); // no locals
            for &ctor in &self.start_funcs {
                body.push(OP_CALL);
                body.uleb128(ctor as u64);
            }
            body.push(OP_END);
            self.codes.push(body.into_bytes());
            self.start_funcs = vec![index];
        }

        let mut out = CodeStream::new();
        out.extend(b"\0asm");
        out.extend(&1u32.to_le_bytes());

        let stack_top = ((self.data_end + STACK_ALIGN - 1) & !(STACK_ALIGN - 1)) + self.stack_size;
        let memory_pages = (stack_top + PAGE_SIZE - 1) / PAGE_SIZE;

        // Type section.
        let mut payload = CodeStream::new();
        payload.uleb128(self.types.len() as u64);
        for sig in &self.types {
            payload.push(0x60);
            payload.uleb128(sig.params.len() as u64);
            payload.extend(&sig.params);
            payload.uleb128(sig.results.len() as u64);
            payload.extend(&sig.results);
        }
        Self::section(&mut out, SEC_TYPE, payload);

        // Import section.
        let imports: Vec<&FuncInfo> = self
            .func_order
            .iter()
            .filter_map(|n| self.func_info.get(n))
            .filter(|i| i.import)
            .collect();
        if !imports.is_empty() {
            let mut payload = CodeStream::new();
            payload.uleb128(imports.len() as u64);
            for (name, info) in self
                .func_order
                .iter()
                .filter_map(|n| self.func_info.get(n).map(|i| (n, i)))
                .filter(|(_, i)| i.import)
            {
                payload.uleb128(self.import_module_name.len() as u64);
                payload.extend(self.import_module_name.as_bytes());
                payload.uleb128(name.len() as u64);
                payload.extend(name.as_bytes());
                payload.push(0x00); // function import
                payload.uleb128(info.type_index as u64);
            }
            Self::section(&mut out, SEC_IMPORT, payload);
        }

        // Function section.
        let defined: Vec<&Name> = self
            .func_order
            .iter()
            .filter(|n| self.func_info.get(*n).map_or(false, |i| !i.import))
            .collect();
        let mut payload = CodeStream::new();
        payload.uleb128(defined.len() as u64);
        for name in &defined {
            payload.uleb128(self.func_info[*name].type_index as u64);
        }
        Self::section(&mut out, SEC_FUNCTION, payload);

        // Table section: slot 0 is null, then the address-taken functions.
        let mut payload = CodeStream::new();
        payload.uleb128(1);
        payload.push(WT_FUNCREF);
        payload.push(0x00);
        payload.uleb128((INDIRECT_FUNCTION_TABLE_START_INDEX + self.indirect_count) as u64);
        Self::section(&mut out, SEC_TABLE, payload);

        // Memory section.
        let mut payload = CodeStream::new();
        payload.uleb128(1);
        payload.push(0x00);
        payload.uleb128(memory_pages.max(1) as u64);
        Self::section(&mut out, SEC_MEMORY, payload);

        // Global section: __stack_pointer first, then the C globals.
        let mut payload = CodeStream::new();
        payload.uleb128(1 + self.wasm_globals.len() as u64);
        payload.push(WT_I32);
        payload.push(0x01); // mutable
        payload.push(OP_I32_CONST);
        payload.sleb128(stack_top as i64);
        payload.push(OP_END);
        for (wt, ival, fval) in &self.wasm_globals {
            payload.push(*wt);
            payload.push(0x01);
            match *wt {
                WT_I64 => {
                    payload.push(OP_I64_CONST);
                    payload.sleb128(*ival);
                }
                WT_F32 => {
                    payload.push(OP_F32_CONST);
                    payload.f32(*fval as f32);
                }
                WT_F64 => {
                    payload.push(OP_F64_CONST);
                    payload.f64(*fval);
                }
                _ => {
                    payload.push(OP_I32_CONST);
                    payload.sleb128(*ival);
                }
            }
            payload.push(OP_END);
        }
        Self::section(&mut out, SEC_GLOBAL, payload);

        // Export section: memory plus every public defined function.
        let exports: Vec<(&Name, u32)> = self
            .func_order
            .iter()
            .filter_map(|n| self.func_info.get(n).map(|i| (n, i)))
            .filter(|(_, i)| i.export)
            .map(|(n, i)| (n, i.index))
            .collect();
        let mut payload = CodeStream::new();
        payload.uleb128(1 + exports.len() as u64);
        payload.uleb128(6);
        payload.extend(b"memory");
        payload.push(0x02);
        payload.uleb128(0);
        for (name, index) in exports {
            payload.uleb128(name.len() as u64);
            payload.extend(name.as_bytes());
            payload.push(0x00);
            payload.uleb128(index as u64);
        }
        Self::section(&mut out, SEC_EXPORT, payload);

        // Start section.
        if let Some(&first) = self.start_funcs.first() {
            debug_assert_eq!(self.start_funcs.len(), 1);
            let mut payload = CodeStream::new();
            payload.uleb128(first as u64);
            Self::section(&mut out, SEC_START, payload);
        }

        // Element section.
        if self.indirect_count > 0 {
            let mut elems: Vec<(u32, u32)> = self
                .func_info
                .values()
                .filter_map(|i| i.indirect_index.map(|t| (t, i.index)))
                .collect();
            elems.sort();
            let mut payload = CodeStream::new();
            payload.uleb128(1);
            payload.uleb128(0);
            payload.push(OP_I32_CONST);
            payload.sleb128(INDIRECT_FUNCTION_TABLE_START_INDEX as i64);
            payload.push(OP_END);
            payload.uleb128(elems.len() as u64);
            for (_, func_index) in elems {
                payload.uleb128(func_index as u64);
            }
            Self::section(&mut out, SEC_ELEM, payload);
        }

        // Code section.
        let mut payload = CodeStream::new();
        payload.uleb128(self.codes.len() as u64);
        for code in &self.codes {
            payload.uleb128(code.len() as u64);
            payload.extend(code);
        }
        Self::section(&mut out, SEC_CODE, payload);

        // Data section.
        if !self.data_segments.is_empty() {
            let mut payload = CodeStream::new();
            payload.uleb128(self.data_segments.len() as u64);
            for (addr, bytes) in &self.data_segments {
                payload.uleb128(0);
                payload.push(OP_I32_CONST);
                payload.sleb128(*addr as i64);
                payload.push(OP_END);
                payload.uleb128(bytes.len() as u64);
                payload.extend(bytes);
            }
            Self::section(&mut out, SEC_DATA, payload);
        }

        out.into_bytes()
    }
}

/// Flatten a static initializer to raw little-endian bytes.
fn flatten_initializer(init: &Initializer, ty: &Type, out: &mut Vec<u8>) {
    match init {
        Initializer::Fixnum(v) => {
            out.extend_from_slice(&v.to_le_bytes()[..ty.size(PTR_SIZE).min(8)]);
        }
        Initializer::Flonum(v) => {
            if ty.size(PTR_SIZE) == 4 {
                out.extend_from_slice(&(*v as f32).to_le_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Initializer::Str(bytes) => out.extend_from_slice(bytes),
        Initializer::Label(..) => {
            // Symbol addresses need relocation support the executable
            // output does not have; zero-fill and let the driver reject
            // such initializers earlier.
            out.extend_from_slice(&[0; 4]);
        }
        Initializer::List(items) => {
            let elem = ty.pointee().cloned();
            for item in items {
                match &elem {
                    Some(et) => flatten_initializer(item, et, out),
                    None => flatten_initializer(item, ty, out),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_dedup() {
        let mut me = ModuleEmitter::new("env");
        let ft = FuncType {
            ret: Type::int(),
            params: vec![Type::int(), Type::int()],
            vaargs: false,
        };
        let a = me.type_index_of(func_sig(&ft));
        let b = me.type_index_of(func_sig(&ft));
        assert_eq!(a, b);
        let ft2 = FuncType {
            ret: Type::Void,
            params: vec![],
            vaargs: false,
        };
        assert_ne!(a, me.type_index_of(func_sig(&ft2)));
    }

    #[test]
    fn aggregate_return_becomes_pointer_param() {
        let sinfo = std::rc::Rc::new(chert_ast::StructInfo {
            name: None,
            members: vec![],
            size: 12,
            align: 4,
            is_union: false,
        });
        let ft = FuncType {
            ret: Type::Struct(sinfo),
            params: vec![Type::int()],
            vaargs: false,
        };
        let sig = func_sig(&ft);
        assert_eq!(sig.params, vec![WT_I32, WT_I32]);
        assert_eq!(sig.results, vec![WT_I32]);
    }

    #[test]
    fn variadic_gets_trailing_pointer() {
        let ft = FuncType {
            ret: Type::int(),
            params: vec![Type::ptr_to(Type::char_())],
            vaargs: true,
        };
        let sig = func_sig(&ft);
        assert_eq!(sig.params, vec![WT_I32, WT_I32]);
    }
}
