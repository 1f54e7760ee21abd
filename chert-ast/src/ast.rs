//! Expressions, statements, declarations, variables and scopes.

use std::rc::Rc;

use chert_entity::{entity_impl, PrimaryMap};

use crate::{FuncType, SourceLoc, Type};

/// An interned identifier. The front end guarantees that equal names compare
/// equal as strings; the backends only ever compare and print them.
pub type Name = Rc<str>;

bitflags::bitflags! {
    /// Storage-class and usage flags on a variable.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Storage: u16 {
        /// `static`
        const STATIC = 1 << 0;
        /// `extern`
        const EXTERN = 1 << 2;
        /// The variable's address is taken somewhere (`&x`).
        const REF_TAKEN = 1 << 7;
        /// Function parameter.
        const PARAM = 1 << 8;
    }
}

impl Storage {
    /// Does this variable live in the function frame (as opposed to static
    /// storage or an external definition)?
    pub fn is_local(self) -> bool {
        !self.intersects(Storage::STATIC | Storage::EXTERN)
    }
}

/// A variable, unique per function body.
///
/// `VarId`s are dense within one function so the backends can attach
/// per-variable state in side tables instead of mutating the AST.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u32);
entity_impl!(VarId, "var");

/// A lexical scope within a function body.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);
entity_impl!(ScopeId, "scope");

/// Information about one declared variable.
#[derive(Clone, Debug)]
pub struct VarInfo {
    /// Dense per-function id (meaningless for globals).
    pub id: VarId,
    /// Declared name.
    pub name: Name,
    /// Resolved type.
    pub ty: Type,
    /// Storage flags.
    pub storage: Storage,
}

/// A lexical scope: its parent and the variables it declares.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    /// Enclosing scope, `None` for a function's top scope.
    pub parent: Option<ScopeId>,
    /// Variables declared directly in this scope.
    pub vars: Vec<VarInfo>,
}

bitflags::bitflags! {
    /// Per-function facts recorded by the front end.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct FuncFlags: u8 {
        /// The function modifies the stack pointer dynamically (`alloca`).
        const STACK_MODIFIED = 1 << 0;
        /// Listed as a module start function (constructor).
        const CONSTRUCTOR = 1 << 1;
    }
}

/// A function definition (or prototype, when `body` is `None`).
#[derive(Clone, Debug)]
pub struct Function {
    /// Function name.
    pub name: Name,
    /// Signature.
    pub ty: Rc<FuncType>,
    /// Parameter variables, in order; they live in `scopes[0]`.
    pub params: Vec<VarId>,
    /// All scopes of the body; index 0 is the top scope holding parameters.
    pub scopes: PrimaryMap<ScopeId, Scope>,
    /// The body block, absent for a prototype.
    pub body: Option<Stmt>,
    /// Storage flags (`static` makes the symbol local).
    pub storage: Storage,
    /// Front-end facts.
    pub flags: FuncFlags,
}

impl Function {
    /// Look up a variable by id, walking all scopes.
    pub fn find_var(&self, id: VarId) -> Option<&VarInfo> {
        self.scopes
            .values()
            .flat_map(|s| s.vars.iter())
            .find(|v| v.id == id)
    }

    /// Look up a name starting from `scope` and walking outwards.
    pub fn resolve(&self, mut scope: ScopeId, name: &str) -> Option<&VarInfo> {
        loop {
            let s = &self.scopes[scope];
            if let Some(v) = s.vars.iter().find(|v| &*v.name == name) {
                return Some(v);
            }
            scope = s.parent?;
        }
    }

    /// The position of `id` in the parameter list, if it is a parameter.
    pub fn param_index(&self, id: VarId) -> Option<usize> {
        self.params.iter().position(|&p| p == id)
    }
}

/// A static initializer, already folded to constants by the front end.
#[derive(Clone, Debug)]
pub enum Initializer {
    /// Integer constant.
    Fixnum(i64),
    /// Floating point constant.
    Flonum(f64),
    /// The address of another symbol, plus a byte offset.
    Label(Name, i64),
    /// A string literal (NUL terminator included).
    Str(Vec<u8>),
    /// Aggregate initializer, one entry per member/element in layout order.
    List(Vec<Initializer>),
}

/// A global (or file-static) variable definition.
#[derive(Clone, Debug)]
pub struct GlobalVar {
    /// Symbol name.
    pub name: Name,
    /// Resolved type.
    pub ty: Type,
    /// Storage flags (`STATIC`, `EXTERN`).
    pub storage: Storage,
    /// Initializer; `None` places the variable in bss.
    pub init: Option<Initializer>,
}

/// A top-level declaration.
#[derive(Clone, Debug)]
pub enum Declaration {
    /// A function definition or prototype.
    DefFun(Function),
    /// A global variable.
    VarDef(GlobalVar),
}

/// One translation unit.
#[derive(Clone, Debug, Default)]
pub struct Module {
    /// Declarations in source order.
    pub decls: Vec<Declaration>,
}

/// Binary operators. Comparison operators keep their source form; the
/// backends derive condition codes (and their complements) from them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    /// `+` (pointer arithmetic already scaled by the front end is *not*
    /// assumed; the backends scale by element size).
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    LShift,
    /// `>>`
    RShift,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `>`
    Gt,
    /// `&&`
    LogAnd,
    /// `||`
    LogOr,
}

impl BinOp {
    /// Is this a comparison producing a 0/1 result?
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Ge | BinOp::Gt
        )
    }
}

/// Unary operators.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    BitNot,
    /// Address-of.
    Ref,
    /// Pointer dereference.
    Deref,
}

/// A typed expression.
#[derive(Clone, Debug)]
pub struct Expr {
    /// What kind of expression this is.
    pub kind: ExprKind,
    /// The resolved type.
    pub ty: Type,
    /// Source location for diagnostics.
    pub loc: SourceLoc,
}

/// Expression kinds.
///
/// The front end desugars before the backends see the tree: compound
/// assignment, `++`/`--` and the conditional operator arrive as plain
/// assignments (through a temporary where needed), so neither backend
/// implements them.
#[derive(Clone, Debug)]
pub enum ExprKind {
    /// Integer literal.
    Fixnum(i64),
    /// Floating point literal.
    Flonum(f64),
    /// String literal (NUL included); typed as `char[]`.
    Str(Vec<u8>),
    /// Variable reference, resolved to its declaring function scope.
    Var {
        /// The variable; `None` for globals referenced by name.
        id: Option<VarId>,
        /// Symbol name.
        name: Name,
    },
    /// Binary operation.
    Bin {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnOp,
        /// Operand.
        sub: Box<Expr>,
    },
    /// Value-preserving or truncating conversion to `Expr::ty`.
    Cast {
        /// The converted operand.
        sub: Box<Expr>,
    },
    /// Assignment; value is the stored value.
    Assign {
        /// Assigned lvalue.
        lhs: Box<Expr>,
        /// Stored value.
        rhs: Box<Expr>,
    },
    /// Comma operator.
    Comma {
        /// Discarded operand.
        lhs: Box<Expr>,
        /// Result operand.
        rhs: Box<Expr>,
    },
    /// Member access on a struct-typed lvalue (the front end rewrites
    /// `p->m` to `(*p).m`).
    Member {
        /// The aggregate.
        sub: Box<Expr>,
        /// Member name, for dumps.
        name: Name,
        /// Byte offset of the member.
        offset: usize,
    },
    /// Function call.
    Funcall {
        /// Callee: a function designator or a function pointer value.
        func: Box<Expr>,
        /// Arguments, already converted to the parameter types.
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Build an integer literal of type `int`.
    pub fn fixnum(value: i64) -> Expr {
        Expr::fixnum_typed(value, Type::int())
    }

    /// Build an integer literal of the given type.
    pub fn fixnum_typed(value: i64, ty: Type) -> Expr {
        Expr {
            kind: ExprKind::Fixnum(value),
            ty,
            loc: SourceLoc::none(),
        }
    }

    /// Build a variable reference.
    pub fn var(info: &VarInfo) -> Expr {
        Expr {
            kind: ExprKind::Var {
                id: Some(info.id),
                name: info.name.clone(),
            },
            ty: info.ty.clone(),
            loc: SourceLoc::none(),
        }
    }

    /// Build a binary operation with an explicit result type.
    pub fn bin(op: BinOp, ty: Type, lhs: Expr, rhs: Expr) -> Expr {
        Expr {
            kind: ExprKind::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            loc: SourceLoc::none(),
        }
    }

    /// Build an assignment expression.
    pub fn assign(lhs: Expr, rhs: Expr) -> Expr {
        Expr {
            kind: ExprKind::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty: Type::Void,
            loc: SourceLoc::none(),
        }
    }

    /// Is this a constant the backends can fold?
    pub fn is_const(&self) -> bool {
        matches!(self.kind, ExprKind::Fixnum(_) | ExprKind::Flonum(_))
    }

    /// The value of a constant, if truthiness can be decided statically.
    pub fn const_truthy(&self) -> Option<bool> {
        match self.kind {
            ExprKind::Fixnum(v) => Some(v != 0),
            ExprKind::Flonum(v) => Some(v != 0.0),
            _ => None,
        }
    }
}

/// One `case`/`default` arm of a switch, in source order.
#[derive(Clone, Debug)]
pub struct CaseInfo {
    /// The case value; `None` for `default`.
    pub value: Option<i64>,
}

/// A statement.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// `;`
    Empty,
    /// Expression statement.
    Expr(Expr),
    /// Brace block with an optional scope of its own.
    Block {
        /// The scope introduced by the block, if it declares variables.
        scope: Option<ScopeId>,
        /// Statements in order.
        stmts: Vec<Stmt>,
    },
    /// `if`/`else`.
    If {
        /// Condition.
        cond: Expr,
        /// Then branch.
        then_br: Box<Stmt>,
        /// Else branch.
        else_br: Option<Box<Stmt>>,
    },
    /// `switch`. The body contains `Case` markers indexing into `cases`.
    Switch {
        /// Dispatch value.
        value: Expr,
        /// The controlled statement.
        body: Box<Stmt>,
        /// All arms, in the order their markers appear in the body.
        cases: Vec<CaseInfo>,
    },
    /// A `case`/`default` marker inside a switch body.
    Case {
        /// Index into the enclosing switch's `cases`.
        index: usize,
    },
    /// `while`.
    While {
        /// Condition.
        cond: Expr,
        /// Body.
        body: Box<Stmt>,
    },
    /// `do … while`.
    DoWhile {
        /// Body.
        body: Box<Stmt>,
        /// Condition.
        cond: Expr,
    },
    /// `for`.
    For {
        /// Init clause (an expression statement or a declaration).
        pre: Option<Box<Stmt>>,
        /// Condition; absent means an infinite loop.
        cond: Option<Expr>,
        /// Post expression.
        post: Option<Expr>,
        /// Body.
        body: Box<Stmt>,
    },
    /// `break`.
    Break,
    /// `continue`.
    Continue,
    /// `goto label;`
    Goto {
        /// Target label name.
        label: Name,
        /// Location, for goto diagnostics.
        loc: SourceLoc,
    },
    /// `label: stmt`
    Label {
        /// Label name.
        name: Name,
        /// The labelled statement.
        stmt: Box<Stmt>,
    },
    /// `return`.
    Return {
        /// Returned value, when present.
        val: Option<Expr>,
    },
    /// A local variable declaration with its initializing statement.
    VarDecl {
        /// The declared variable.
        var: VarId,
        /// Initialization, already lowered to an assignment statement.
        init: Option<Box<Stmt>>,
    },
    /// Inline assembly passed through verbatim.
    Asm {
        /// Assembly text (native) or comma-separated opcode bytes (wasm).
        text: String,
    },
}

impl Stmt {
    /// Wrap statements in a scopeless block.
    pub fn block(stmts: Vec<Stmt>) -> Stmt {
        Stmt::Block { scope: None, stmts }
    }
}
