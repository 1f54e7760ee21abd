//! WebAssembly emitter for the chert C toolchain.
//!
//! Unlike the native backends this path consumes the typed AST directly:
//! wasm's structured control flow matches C's surface syntax far better
//! than an arbitrary control flow graph would, so no basic-block IR is
//! built. Statements lower to `block`/`loop`/`if` nests, locals map to wasm
//! locals or to a shadow-stack frame in linear memory, and forward `goto`s
//! are patched into `br` instructions after their label is seen.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]

pub mod opcodes;

mod code_translator;
mod module;
mod state;

pub use crate::code_translator::FuncTranslator;
pub use crate::module::{ModuleEmitter, STACK_ALIGN};
pub use crate::state::{CodeStream, GotoPatch, TranslationState};

/// Errors that abort wasm emission outright. User-level problems (an
/// unsupported goto, a non-constant switch value) go through the
/// `Diagnostics` sink instead.
#[derive(Debug, thiserror::Error)]
pub enum WasmError {
    /// The input violated the typed-AST contract.
    #[error("malformed input: {0}")]
    Malformed(String),
    /// Writing the output failed.
    #[error("output error")]
    Io(#[from] std::io::Error),
}

/// A convenient alias for a `Result` that uses `WasmError` as the error.
pub type WasmResult<T> = Result<T, WasmError>;
