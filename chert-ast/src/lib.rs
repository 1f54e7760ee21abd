//! The typed abstract syntax tree consumed by the chert backends.
//!
//! The lexer, preprocessor, parser and type-checker are external
//! collaborators: they hand the backends a `Module` in which every
//! expression carries a resolved `Type`, every local variable is linked to
//! its `Scope`, and storage flags are already set. Nothing in this crate
//! performs name resolution or type checking; it is the contract between the
//! front end and the two code generators.

#![deny(missing_docs)]

mod ast;
mod diag;
mod types;

pub use crate::ast::{
    BinOp, CaseInfo, Declaration, Expr, ExprKind, FuncFlags, Function, GlobalVar, Initializer,
    Module, Name, Scope, ScopeId, Stmt, Storage, UnOp, VarId, VarInfo,
};
pub use crate::diag::{Diagnostic, Diagnostics, Severity};
pub use crate::types::{FixnumKind, FlonumKind, FuncType, MemberInfo, StructInfo, Type};

/// A source location attached to expressions and diagnostics.
///
/// Only the line number survives preprocessing; that is all the backends
/// need for their diagnostics, and no debug info beyond line numbers is
/// ever generated.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SourceLoc(pub u32);

impl SourceLoc {
    /// A location that does not point at source.
    pub fn none() -> Self {
        SourceLoc(0)
    }

    /// Is this a real location?
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if self.is_none() {
            write!(f, "<unknown>")
        } else {
            write!(f, "line {}", self.0)
        }
    }
}
