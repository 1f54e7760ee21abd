//! Whole-module emission checks on hand-built typed ASTs.

use std::rc::Rc;

use chert_ast::{
    BinOp, CaseInfo, Declaration, Diagnostics, Expr, ExprKind, FuncType, Function, Module,
    Scope, ScopeId, Stmt, Storage, Type, VarId, VarInfo,
};
use chert_entity::{EntityRef, PrimaryMap};
use chert_wasm::{opcodes, ModuleEmitter};

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

    fn local(&mut self, name: &str, ty: Type) -> VarInfo {
        self.add_var(name, ty, Storage::empty())
    }

    fn build(self, name: &str, ret: Type, body: Stmt) -> Function {
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
                vaargs: false,
            }),
            params: self.params,
            scopes: self.scopes,
            body: Some(body),
            storage: Storage::empty(),
            flags: Default::default(),
        }
    }
}

fn ret(val: Expr) -> Stmt {
    Stmt::Return { val: Some(val) }
}

fn emit(module: &Module) -> (Vec<u8>, Diagnostics) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut diag = Diagnostics::new();
    let bytes = ModuleEmitter::new("env")
        .emit(module, &mut diag)
        .expect("emission failed");
    (bytes, diag)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn module_header_and_export() {
    // int main(){return 123;}
    let fb = FuncBuilder::new();
    let main = fb.build("main", Type::int(), Stmt::block(vec![ret(Expr::fixnum(123))]));
    let module = Module {
        decls: vec![Declaration::DefFun(main)],
    };
    let (bytes, diag) = emit(&module);
    assert!(!diag.has_errors(), "{:?}", diag.reports());

    assert_eq!(&bytes[..8], b"\0asm\x01\0\0\0");
    assert!(contains(&bytes, b"main"), "export name missing");
    assert!(contains(&bytes, b"memory"));
    // i32.const 123 (sleb128: fb 00), then the function's end.
    assert!(contains(
        &bytes,
        &[opcodes::OP_I32_CONST, 0xfb, 0x00]
    ));
}

#[test]
fn call_between_functions() {
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
    let callee_ty = Type::Func(Rc::new(FuncType {
        ret: Type::int(),
        params: vec![Type::int(), Type::int()],
        vaargs: false,
    }));
    let fb = FuncBuilder::new();
    let main = fb.build(
        "main",
        Type::int(),
        Stmt::block(vec![ret(Expr {
            kind: ExprKind::Funcall {
                func: Box::new(Expr {
                    kind: ExprKind::Var {
                        id: None,
                        name: "add".into(),
                    },
                    ty: callee_ty,
                    loc: Default::default(),
                }),
                args: vec![Expr::fixnum(40), Expr::fixnum(2)],
            },
            ty: Type::int(),
            loc: Default::default(),
        })]),
    );
    let module = Module {
        decls: vec![Declaration::DefFun(add), Declaration::DefFun(main)],
    };
    let (bytes, diag) = emit(&module);
    assert!(!diag.has_errors(), "{:?}", diag.reports());

    // add's body: local.get 0; local.get 1; i32.add
    assert!(contains(
        &bytes,
        &[
            opcodes::OP_LOCAL_GET,
            0x00,
            opcodes::OP_LOCAL_GET,
            0x01,
            opcodes::OP_I32_ADD
        ]
    ));
    // main calls function index 1 (add is 0 or 1 depending on order; both
    // are defined, no imports, so add == 0).
    assert!(contains(&bytes, &[opcodes::OP_CALL, 0x00]));
}

#[test]
fn dense_switch_uses_br_table() {
    let mut fb = FuncBuilder::new();
    let x = fb.param("x", Type::int());
    let cases = vec![
        CaseInfo { value: Some(1) },
        CaseInfo { value: Some(2) },
        CaseInfo { value: Some(3) },
        CaseInfo { value: Some(4) },
        CaseInfo { value: None },
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
    let (bytes, diag) = emit(&module);
    assert!(!diag.has_errors(), "{:?}", diag.reports());
    // br_table with a 4-entry range.
    assert!(contains(&bytes, &[opcodes::OP_BR_TABLE, 0x04]));
}

#[test]
fn switch_density_boundary_falls_back_to_chain() {
    // Values {1,2,3,9}: range (9-1+1) = 9 against 2*4 = 8, so the density
    // (max - min + 1) / case_count exceeds 2 and a table would waste
    // slots; the dispatch must be the eq/br_if chain.
    let mut fb = FuncBuilder::new();
    let x = fb.param("x", Type::int());
    let cases = vec![
        CaseInfo { value: Some(1) },
        CaseInfo { value: Some(2) },
        CaseInfo { value: Some(3) },
        CaseInfo { value: Some(9) },
    ];
    let body = Stmt::block(vec![
        Stmt::Case { index: 0 },
        ret(Expr::fixnum(10)),
        Stmt::Case { index: 1 },
        ret(Expr::fixnum(20)),
        Stmt::Case { index: 2 },
        ret(Expr::fixnum(30)),
        Stmt::Case { index: 3 },
        ret(Expr::fixnum(90)),
    ]);
    let g = fb.build(
        "g",
        Type::int(),
        Stmt::block(vec![
            Stmt::Switch {
                value: Expr::var(&x),
                body: Box::new(body),
                cases,
            },
            ret(Expr::fixnum(0)),
        ]),
    );
    let module = Module {
        decls: vec![Declaration::DefFun(g)],
    };
    let (bytes, diag) = emit(&module);
    assert!(!diag.has_errors(), "{:?}", diag.reports());
    assert!(contains(&bytes, &[opcodes::OP_I32_EQ, opcodes::OP_BR_IF]));
    // A table over this switch would announce a 9-entry range.
    assert!(!contains(&bytes, &[opcodes::OP_BR_TABLE, 0x09]));
}

#[test]
fn sparse_switch_uses_compare_chain() {
    let mut fb = FuncBuilder::new();
    let x = fb.param("x", Type::int());
    let cases = vec![
        CaseInfo { value: Some(1) },
        CaseInfo { value: Some(1000) },
    ];
    let body = Stmt::block(vec![
        Stmt::Case { index: 0 },
        ret(Expr::fixnum(10)),
        Stmt::Case { index: 1 },
        ret(Expr::fixnum(20)),
    ]);
    let g = fb.build(
        "g",
        Type::int(),
        Stmt::block(vec![
            Stmt::Switch {
                value: Expr::var(&x),
                body: Box::new(body),
                cases,
            },
            ret(Expr::fixnum(0)),
        ]),
    );
    let module = Module {
        decls: vec![Declaration::DefFun(g)],
    };
    let (bytes, diag) = emit(&module);
    assert!(!diag.has_errors(), "{:?}", diag.reports());
    assert!(contains(&bytes, &[opcodes::OP_I32_EQ, opcodes::OP_BR_IF]));
}

#[test]
fn forward_goto_patches_to_depth_zero() {
    // int main(){int x=0; goto L; L: x=7; return x;}
    let mut fb = FuncBuilder::new();
    let x = fb.local("x", Type::int());
    let body = Stmt::block(vec![
        Stmt::VarDecl {
            var: x.id,
            init: Some(Box::new(Stmt::Expr(Expr::assign(
                Expr::var(&x),
                Expr::fixnum(0),
            )))),
        },
        Stmt::Goto {
            label: "L".into(),
            loc: Default::default(),
        },
        Stmt::Label {
            name: "L".into(),
            stmt: Box::new(Stmt::Expr(Expr::assign(Expr::var(&x), Expr::fixnum(7)))),
        },
        ret(Expr::var(&x)),
    ]);
    let main = fb.build("main", Type::int(), body);
    let module = Module {
        decls: vec![Declaration::DefFun(main)],
    };
    let (bytes, diag) = emit(&module);
    assert!(!diag.has_errors(), "{:?}", diag.reports());
    // The goto became `br 0` out of the label's block.
    assert!(contains(
        &bytes,
        &[opcodes::OP_BR, 0x00, opcodes::OP_END]
    ));
}

#[test]
fn goto_into_deeper_block_is_diagnosed() {
    // goto L; while (x) { L: ; }  — the label is deeper than the goto.
    let mut fb = FuncBuilder::new();
    let x = fb.param("x", Type::int());
    let body = Stmt::block(vec![
        Stmt::Goto {
            label: "L".into(),
            loc: Default::default(),
        },
        Stmt::While {
            cond: Expr::var(&x),
            body: Box::new(Stmt::block(vec![Stmt::Label {
                name: "L".into(),
                stmt: Box::new(Stmt::Empty),
            }])),
        },
        ret(Expr::fixnum(0)),
    ]);
    let main = fb.build("main", Type::int(), body);
    let module = Module {
        decls: vec![Declaration::DefFun(main)],
    };
    let (_, diag) = emit(&module);
    assert!(diag.has_errors(), "deeper-label goto must be rejected");
}

#[test]
fn address_taken_local_moves_to_the_shadow_stack() {
    // int main(){int x; int *p=&x; *p=5; return x;}
    let mut fb = FuncBuilder::new();
    let x = fb.add_var("x", Type::int(), Storage::REF_TAKEN);
    let p = fb.local("p", Type::ptr_to(Type::int()));
    let addr_of_x = Expr {
        kind: ExprKind::Unary {
            op: chert_ast::UnOp::Ref,
            sub: Box::new(Expr::var(&x)),
        },
        ty: Type::ptr_to(Type::int()),
        loc: Default::default(),
    };
    let deref_p = Expr {
        kind: ExprKind::Unary {
            op: chert_ast::UnOp::Deref,
            sub: Box::new(Expr::var(&p)),
        },
        ty: Type::int(),
        loc: Default::default(),
    };
    let body = Stmt::block(vec![
        Stmt::VarDecl { var: x.id, init: None },
        Stmt::VarDecl {
            var: p.id,
            init: Some(Box::new(Stmt::Expr(Expr::assign(Expr::var(&p), addr_of_x)))),
        },
        Stmt::Expr(Expr::assign(deref_p, Expr::fixnum(5))),
        ret(Expr::var(&x)),
    ]);
    let main = fb.build("main", Type::int(), body);
    let module = Module {
        decls: vec![Declaration::DefFun(main)],
    };
    let (bytes, diag) = emit(&module);
    assert!(!diag.has_errors(), "{:?}", diag.reports());
    // A frame means the prologue captures the stack pointer global.
    assert!(contains(
        &bytes,
        &[opcodes::OP_GLOBAL_GET, 0x00, opcodes::OP_LOCAL_SET]
    ));
    // And the store goes through linear memory.
    assert!(contains(&bytes, &[opcodes::OP_I32_STORE]));
}
