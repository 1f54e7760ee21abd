//! Native code generator for the chert C toolchain.
//!
//! The pipeline for each function: the typed AST is lowered to basic-block
//! IR over virtual registers, converted to SSA form, optimized, taken back
//! out of SSA, analyzed for liveness, register-allocated by linear scan,
//! given a stack frame, and finally emitted as assembly text for one of the
//! supported instruction set architectures.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use chert_entity as entity;

pub mod ir;
pub mod isa;
pub mod write;

mod builder;
mod context;
mod liveness;
mod opt;
mod regalloc;
mod ssa;
mod stack_layout;

pub use crate::context::Context;
pub use crate::regalloc::{IntervalState, LiveInterval, RegAlloc, RegAllocFlags};
pub use crate::write::write_function;

use chert_ast::SourceLoc;

/// Errors produced entirely inside the code generator.
///
/// User-level problems (bad goto, use of an unsupported construct) go to the
/// `Diagnostics` sink instead; a `CodegenError` means the caller cannot get
/// output at all.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The requested target is not supported by this build.
    #[error("unsupported target: {0}")]
    Unsupported(String),
    /// The input violated the typed-AST contract.
    #[error("{loc}: malformed input: {message}")]
    Malformed {
        /// Where the violation was noticed.
        loc: SourceLoc,
        /// What was violated.
        message: String,
    },
    /// Writing the output failed.
    #[error("output error")]
    Io(#[from] std::io::Error),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error.
pub type CodegenResult<T> = Result<T, CodegenError>;
