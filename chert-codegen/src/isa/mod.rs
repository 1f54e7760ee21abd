//! Instruction set architectures supported by chert.
//!
//! The `TargetIsa` trait is the boundary between the machine-independent
//! passes and the per-architecture backends: the register allocator asks it
//! for register-file shape and fixed-register constraints, the driver asks
//! it to emit assembly.

pub mod riscv64;
pub mod x64;

use std::io::Write;

use target_lexicon::{Architecture, Triple};

use crate::ir::{FuncBackend, Inst, PhysReg, RegBits};
use crate::regalloc::RegAlloc;
use crate::{CodegenError, CodegenResult};
use chert_ast::{Function, GlobalVar};

/// Methods that must be implemented by every supported ISA.
pub trait TargetIsa {
    /// Short name of this ISA ("x64", "riscv64").
    fn name(&self) -> &'static str;

    /// Pointer size in bytes.
    fn pointer_size(&self) -> usize {
        8
    }

    /// Number of allocatable integer registers. Physical register ids
    /// `0..count` are allocatable; ids at and above `count` are scratch
    /// registers reserved for spill traffic.
    fn int_reg_count(&self) -> usize;

    /// Number of allocatable floating point registers.
    fn float_reg_count(&self) -> usize;

    /// Physical ids of the integer argument registers, in ABI order.
    fn int_arg_regs(&self) -> &'static [PhysReg];

    /// Number of floating point argument registers (always `fa0..faN` /
    /// `xmm0..xmmN`, physical ids equal to the argument position).
    fn float_arg_reg_count(&self) -> usize;

    /// Callee-saved integer registers, as a mask over allocatable ids.
    fn callee_saved_mask(&self) -> RegBits;

    /// Callee-saved floating point registers.
    fn callee_saved_fmask(&self) -> RegBits;

    /// Integer registers a call clobbers.
    fn call_clobber_mask(&self) -> RegBits;

    /// Floating point registers a call clobbers.
    fn call_clobber_fmask(&self) -> RegBits;

    /// Integer registers `inst` needs for itself (fixed-register machine
    /// idioms: division pairs, shift counts, argument registers). Live
    /// intervals crossing the instruction must not be allocated to these.
    fn inst_occupied_mask(&self, inst: &Inst, ra: &RegAlloc) -> RegBits;

    /// Floating point registers `inst` needs for itself (argument
    /// registers inside a call sequence).
    fn inst_occupied_fmask(&self, inst: &Inst, ra: &RegAlloc) -> RegBits {
        let _ = (inst, ra);
        0
    }

    /// Offset of the first stack-passed parameter from the frame pointer.
    fn stack_param_base(&self) -> i32;

    /// Bytes of the register save area a variadic function reserves at the
    /// bottom of its frame.
    fn vaarg_save_area_size(&self) -> usize;

    /// Frame offset where `va_start` points after `ireg_params` named
    /// integer parameters.
    fn vaarg_start_offset(&self, ireg_params: usize) -> i32;

    /// Emit one compiled function as assembly text.
    fn emit_function(
        &self,
        out: &mut dyn Write,
        func: &Function,
        fnbe: &mut FuncBackend,
    ) -> CodegenResult<()>;

    /// Emit a global variable definition.
    fn emit_global(&self, out: &mut dyn Write, gvar: &GlobalVar) -> CodegenResult<()>;

    /// Emit an anonymous read-only byte blob (string literals).
    fn emit_rodata(&self, out: &mut dyn Write, label: &str, bytes: &[u8]) -> CodegenResult<()>;
}

/// Look up the backend for a target triple.
pub fn lookup(triple: &Triple) -> CodegenResult<Box<dyn TargetIsa>> {
    match triple.architecture {
        Architecture::X86_64 => Ok(Box::new(x64::X64Backend::new())),
        Architecture::Riscv64(_) => Ok(Box::new(riscv64::Riscv64Backend::new())),
        other => Err(CodegenError::Unsupported(other.to_string())),
    }
}

/// Look up the backend for the host machine.
pub fn lookup_host() -> CodegenResult<Box<dyn TargetIsa>> {
    lookup(&Triple::host())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lookup_by_triple() {
        let isa = lookup(&Triple::from_str("x86_64-unknown-linux-gnu").unwrap()).unwrap();
        assert_eq!(isa.name(), "x64");
        let isa = lookup(&Triple::from_str("riscv64gc-unknown-linux-gnu").unwrap()).unwrap();
        assert_eq!(isa.name(), "riscv64");
        assert!(lookup(&Triple::from_str("i686-unknown-linux-gnu").unwrap()).is_err());
    }
}
