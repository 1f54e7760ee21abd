//! End-to-end checks: hand-built typed ASTs through the whole pipeline to
//! assembly text, plus the allocator invariants on the way out.

use std::rc::Rc;

use chert_ast::{
    BinOp, Declaration, Diagnostics, Expr, ExprKind, FuncType, Function, Module, Scope,
    ScopeId, Stmt, Storage, Type, UnOp, VarId, VarInfo,
};
use chert_codegen::entity::{EntityRef, PrimaryMap};
use chert_codegen::isa::x64::X64Backend;
use chert_codegen::isa::{riscv64::Riscv64Backend, TargetIsa};
use chert_codegen::{Context, IntervalState};

/// Small helper assembling one function the way the front end would.
struct FuncBuilder {
    scopes: PrimaryMap<ScopeId, Scope>,
    params: Vec<VarId>,
    next: u32,
}

impl FuncBuilder {
    fn new() -> FuncBuilder {
        let mut scopes = PrimaryMap::new();
        scopes.push(Scope::default());
        FuncBuilder {
            scopes,
            params: Vec::new(),
            next: 0,
        }
    }

    fn add_var(&mut self, name: &str, ty: Type, storage: Storage) -> VarInfo {
        let id = VarId::new(self.next as usize);
        self.next += 1;
        let info = VarInfo {
            id,
            name: name.into(),
            ty,
            storage,
        };
        self.scopes[ScopeId::new(0)].vars.push(info.clone());
        info
    }

    fn param(&mut self, name: &str, ty: Type) -> VarInfo {
        let info = self.add_var(name, ty, Storage::PARAM);
        self.params.push(info.id);
        info
    }

    fn param_ref_taken(&mut self, name: &str, ty: Type) -> VarInfo {
        let info = self.add_var(name, ty, Storage::PARAM | Storage::REF_TAKEN);
        self.params.push(info.id);
        info
    }

    fn local(&mut self, name: &str, ty: Type) -> VarInfo {
        self.add_var(name, ty, Storage::empty())
    }

    fn build(self, name: &str, ret: Type, body: Stmt) -> Function {
        self.build_with(name, ret, body, false)
    }

    fn build_with(self, name: &str, ret: Type, body: Stmt, vaargs: bool) -> Function {
        let params_ty = self
            .params
            .iter()
            .map(|id| {
                self.scopes
                    .values()
                    .flat_map(|s| s.vars.iter())
                    .find(|v| v.id == *id)
                    .map(|v| v.ty.clone())
                    .unwrap_or(Type::int())
            })
            .collect();
        Function {
            name: name.into(),
            ty: Rc::new(FuncType {
                ret,
                params: params_ty,
                vaargs,
            }),
            params: self.params,
            scopes: self.scopes,
            body: Some(body),
            storage: Storage::empty(),
            flags: Default::default(),
        }
    }
}

fn call(name: &str, sig: FuncType, args: Vec<Expr>, ret: Type) -> Expr {
    Expr {
        kind: ExprKind::Funcall {
            func: Box::new(Expr {
                kind: ExprKind::Var {
                    id: None,
                    name: name.into(),
                },
                ty: Type::Func(Rc::new(sig)),
                loc: Default::default(),
            }),
            args,
        },
        ty: ret,
        loc: Default::default(),
    }
}

fn ret(val: Expr) -> Stmt {
    Stmt::Return { val: Some(val) }
}

fn compile_to_asm(module: &Module, isa: &dyn TargetIsa) -> String {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut ctx = Context::new();
    let mut diag = Diagnostics::new();
    let mut out = Vec::new();
    ctx.compile_module(module, isa, &mut diag, &mut out)
        .expect("compilation failed");
    assert!(!diag.has_errors(), "diagnostics: {:?}", diag.reports());
    String::from_utf8(out).expect("asm is text")
}

/// After allocation, intervals sharing a physical register never overlap,
/// and nobody sits in a register its occupied mask forbids.
fn check_allocation(fnbe: &chert_codegen::ir::FuncBackend) {
    let ra = &fnbe.ra;
    for &i in &ra.sorted {
        let a = &ra.intervals[i];
        if let Some(p) = a.phys {
            assert_eq!(
                a.occupied & (1 << p),
                0,
                "{} was assigned an occupied register",
                a.virt
            );
        }
        if a.state == IntervalState::Spill {
            continue;
        }
        for &j in &ra.sorted {
            if i == j {
                continue;
            }
            let b = &ra.intervals[j];
            if b.state == IntervalState::Spill || a.phys != b.phys || a.phys.is_none() {
                continue;
            }
            if ra.vregs[a.virt].is_flonum() != ra.vregs[b.virt].is_flonum() {
                continue;
            }
            assert!(
                a.end < b.start || b.end < a.start,
                "{} and {} share a register with overlapping lives",
                a.virt,
                b.virt
            );
        }
    }
}

#[test]
fn return_constant() {
    // int main(){return 123;}
    let fb = FuncBuilder::new();
    let main = fb.build("main", Type::int(), Stmt::block(vec![ret(Expr::fixnum(123))]));
    let module = Module {
        decls: vec![Declaration::DefFun(main)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    assert!(asm.contains("\t.globl\tmain"));
    assert!(asm.contains("main:"));
    assert!(asm.contains("mov\t$123, %eax"));
    assert!(asm.contains("\tret"));
}

#[test]
fn call_with_register_arguments() {
    // int add(int a,int b){return a+b;} int main(){return add(40,2);}
    let mut fb = FuncBuilder::new();
    let a = fb.param("a", Type::int());
    let b = fb.param("b", Type::int());
    let add = fb.build(
        "add",
        Type::int(),
        Stmt::block(vec![ret(Expr::bin(
            BinOp::Add,
            Type::int(),
            Expr::var(&a),
            Expr::var(&b),
        ))]),
    );
    let sig = FuncType {
        ret: Type::int(),
        params: vec![Type::int(), Type::int()],
        vaargs: false,
    };
    let fb = FuncBuilder::new();
    let main = fb.build(
        "main",
        Type::int(),
        Stmt::block(vec![ret(call(
            "add",
            sig,
            vec![Expr::fixnum(40), Expr::fixnum(2)],
            Type::int(),
        ))]),
    );

    // The allocator must cope without spilling anything here.
    let mut ctx = Context::new();
    let mut diag = Diagnostics::new();
    let isa = X64Backend::new();
    let fnbe = ctx
        .compile_function(&add, &isa, &mut diag)
        .expect("add compiles");
    check_allocation(&fnbe);
    assert!(fnbe
        .ra
        .intervals
        .iter()
        .all(|li| li.state != IntervalState::Spill));

    let module = Module {
        decls: vec![Declaration::DefFun(add), Declaration::DefFun(main)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    assert!(asm.contains("call\tadd"));
}

#[test]
fn summing_loop_compiles_with_disjoint_registers() {
    // int f(int n){int s=0; for(int i=0;i<n;i=i+1) s=s+i; return s;}
    let mut fb = FuncBuilder::new();
    let n = fb.param("n", Type::int());
    let s = fb.local("s", Type::int());
    let i = fb.local("i", Type::int());
    let body = Stmt::block(vec![
        Stmt::VarDecl {
            var: s.id,
            init: Some(Box::new(Stmt::Expr(Expr::assign(
                Expr::var(&s),
                Expr::fixnum(0),
            )))),
        },
        Stmt::For {
            pre: Some(Box::new(Stmt::VarDecl {
                var: i.id,
                init: Some(Box::new(Stmt::Expr(Expr::assign(
                    Expr::var(&i),
                    Expr::fixnum(0),
                )))),
            })),
            cond: Some(Expr::bin(
                BinOp::Lt,
                Type::int(),
                Expr::var(&i),
                Expr::var(&n),
            )),
            post: Some(Expr::assign(
                Expr::var(&i),
                Expr::bin(BinOp::Add, Type::int(), Expr::var(&i), Expr::fixnum(1)),
            )),
            body: Box::new(Stmt::Expr(Expr::assign(
                Expr::var(&s),
                Expr::bin(BinOp::Add, Type::int(), Expr::var(&s), Expr::var(&i)),
            ))),
        },
        ret(Expr::var(&s)),
    ]);
    let f = fb.build("f", Type::int(), body);

    let mut ctx = Context::new();
    let mut diag = Diagnostics::new();
    let isa = X64Backend::new();
    let fnbe = ctx.compile_function(&f, &isa, &mut diag).expect("compiles");
    assert!(!diag.has_errors());
    check_allocation(&fnbe);

    let module = Module {
        decls: vec![Declaration::DefFun(f)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    // The loop guard compares and conditionally branches.
    assert!(asm.contains("\tjl\t") || asm.contains("\tjge\t"), "{}", asm);
}

#[test]
fn dense_switch_uses_a_jump_table() {
    // int g(int x){switch(x){case 1..4: return 10*k; default: return 0;}}
    let mut fb = FuncBuilder::new();
    let x = fb.param("x", Type::int());
    let cases = vec![
        chert_ast::CaseInfo { value: Some(1) },
        chert_ast::CaseInfo { value: Some(2) },
        chert_ast::CaseInfo { value: Some(3) },
        chert_ast::CaseInfo { value: Some(4) },
        chert_ast::CaseInfo { value: None },
    ];
    let body = Stmt::block(vec![
        Stmt::Case { index: 0 },
        ret(Expr::fixnum(10)),
        Stmt::Case { index: 1 },
        ret(Expr::fixnum(20)),
        Stmt::Case { index: 2 },
        ret(Expr::fixnum(30)),
        Stmt::Case { index: 3 },
        ret(Expr::fixnum(40)),
        Stmt::Case { index: 4 },
        ret(Expr::fixnum(0)),
    ]);
    let g = fb.build(
        "g",
        Type::int(),
        Stmt::block(vec![Stmt::Switch {
            value: Expr::var(&x),
            body: Box::new(body),
            cases,
        }]),
    );
    let module = Module {
        decls: vec![Declaration::DefFun(g)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    assert!(asm.contains("_tab"), "expected a jump table:\n{}", asm);
    assert!(asm.contains("\t.quad\t.L"), "{}", asm);
}

#[test]
fn division_reserves_the_division_pair() {
    // int main(){int a=100; return a/7;}  — with `a` opaque enough that
    // folding cannot remove the division.
    let mut fb = FuncBuilder::new();
    let a = fb.param("a", Type::int());
    let f = fb.build(
        "div7",
        Type::int(),
        Stmt::block(vec![ret(Expr::bin(
            BinOp::Div,
            Type::int(),
            Expr::var(&a),
            Expr::fixnum(7),
        ))]),
    );
    let mut ctx = Context::new();
    let mut diag = Diagnostics::new();
    let isa = X64Backend::new();
    let fnbe = ctx.compile_function(&f, &isa, &mut diag).expect("compiles");
    check_allocation(&fnbe);

    let module = Module {
        decls: vec![Declaration::DefFun(f)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    assert!(asm.contains("\tidiv\t"), "{}", asm);
    assert!(asm.contains("cltd"), "{}", asm);
}

#[test]
fn constant_division_folds_away() {
    // int main(){int a=100; return a/7;} with a local: the optimizer sees
    // through the copy and folds to 14.
    let mut fb = FuncBuilder::new();
    let a = fb.local("a", Type::int());
    let main = fb.build(
        "main",
        Type::int(),
        Stmt::block(vec![
            Stmt::VarDecl {
                var: a.id,
                init: Some(Box::new(Stmt::Expr(Expr::assign(
                    Expr::var(&a),
                    Expr::fixnum(100),
                )))),
            },
            ret(Expr::bin(
                BinOp::Div,
                Type::int(),
                Expr::var(&a),
                Expr::fixnum(7),
            )),
        ]),
    );
    let module = Module {
        decls: vec![Declaration::DefFun(main)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    assert!(asm.contains("mov\t$14, %eax"), "{}", asm);
    assert!(!asm.contains("idiv"), "{}", asm);
}

#[test]
fn asm_only_body_has_no_prologue() {
    let fb = FuncBuilder::new();
    let f = fb.build(
        "spin",
        Type::Void,
        Stmt::block(vec![Stmt::Asm {
            text: "nop".to_string(),
        }]),
    );
    let module = Module {
        decls: vec![Declaration::DefFun(f)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    assert!(asm.contains("\tnop"));
    assert!(!asm.contains("push"), "{}", asm);
    assert!(!asm.contains("sub\t$"), "{}", asm);
}

#[test]
fn address_taken_parameter_lands_in_memory() {
    // int f(int x){ return *&x; }
    let mut fb = FuncBuilder::new();
    let x = fb.param_ref_taken("x", Type::int());
    let deref = Expr {
        kind: ExprKind::Unary {
            op: UnOp::Deref,
            sub: Box::new(Expr {
                kind: ExprKind::Unary {
                    op: UnOp::Ref,
                    sub: Box::new(Expr::var(&x)),
                },
                ty: Type::ptr_to(Type::int()),
                loc: Default::default(),
            }),
        },
        ty: Type::int(),
        loc: Default::default(),
    };
    let f = fb.build("f", Type::int(), Stmt::block(vec![ret(deref)]));
    let module = Module {
        decls: vec![Declaration::DefFun(f)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    // Prologue stores the incoming register; the read goes through memory.
    assert!(asm.contains("mov\t%edi, -"), "{}", asm);
    assert!(asm.contains("(%rbp)"), "{}", asm);
}

#[test]
fn variadic_saves_unnamed_registers() {
    let mut fb = FuncBuilder::new();
    let fmt = fb.param("fmt", Type::ptr_to(Type::char_()));
    let ap = fb.local("ap", Type::ptr_to(Type::char_()));
    let va_start_sig = FuncType {
        ret: Type::Void,
        params: vec![],
        vaargs: true,
    };
    let body = Stmt::block(vec![
        Stmt::VarDecl { var: ap.id, init: None },
        Stmt::Expr(call(
            "__builtin_va_start",
            va_start_sig,
            vec![Expr::var(&ap), Expr::var(&fmt)],
            Type::Void,
        )),
        ret(Expr::fixnum(0)),
    ]);
    let f = fb.build_with("vtest", Type::int(), body, true);

    let mut ctx = Context::new();
    let mut diag = Diagnostics::new();
    let isa = X64Backend::new();
    let fnbe = ctx.compile_function(&f, &isa, &mut diag).expect("compiles");
    assert!(!diag.has_errors(), "{:?}", diag.reports());
    // One named integer parameter: va_start points at the second slot of
    // the 112-byte save area.
    assert_eq!(fnbe.vaarg_frame.offset(), -104);

    let module = Module {
        decls: vec![Declaration::DefFun(f)],
    };
    let asm = compile_to_asm(&module, &X64Backend::new());
    assert!(asm.contains("mov\t%rsi, -104(%rbp)"), "{}", asm);
    assert!(asm.contains("movsd\t%xmm0, -64(%rbp)"), "{}", asm);
}

#[test]
fn riscv_backend_is_a_peer() {
    let fb = FuncBuilder::new();
    let main = fb.build("main", Type::int(), Stmt::block(vec![ret(Expr::fixnum(7))]));
    let module = Module {
        decls: vec![Declaration::DefFun(main)],
    };
    let asm = compile_to_asm(&module, &Riscv64Backend::new());
    assert!(asm.contains("main:"));
    assert!(asm.contains("li\ta0, 7"), "{}", asm);
    assert!(asm.contains("\tret"));
}

#[test]
fn dump_interface_lists_blocks_and_intervals() {
    let mut fb = FuncBuilder::new();
    let n = fb.param("n", Type::int());
    let f = fb.build(
        "twice",
        Type::int(),
        Stmt::block(vec![ret(Expr::bin(
            BinOp::Add,
            Type::int(),
            Expr::var(&n),
            Expr::var(&n),
        ))]),
    );
    let module = Module {
        decls: vec![Declaration::DefFun(f)],
    };
    let mut ctx = Context::new();
    let mut diag = Diagnostics::new();
    let mut out = Vec::new();
    ctx.dump_module(&module, &X64Backend::new(), &mut diag, &mut out)
        .expect("dump");
    let text = String::from_utf8(out).expect("text");
    assert!(text.contains("### twice"));
    assert!(text.contains("params and locals:"));
    assert!(text.contains("VREG: #"));
    assert!(text.contains("BB: #"));
    assert!(text.contains("RESULT"));
}
