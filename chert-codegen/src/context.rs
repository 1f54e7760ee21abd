//! A compilation context: the passes, in order, for one translation unit.
//!
//! The context owns the module-wide state (label generator, string pool)
//! and runs each function through the fixed pipeline: lower the AST to IR,
//! optimize on SSA form, recompute liveness, allocate registers, insert
//! spill traffic, lay out the frame, and emit. Functions whose lowering
//! reported diagnostics produce no code but do not stop the other
//! functions from compiling.

use std::io::Write;

use log::debug;

use crate::builder::{gen_defun, LabelGen, StringPool};
use crate::ir::FuncBackend;
use crate::isa::TargetIsa;
use crate::liveness::analyze_reg_flow;
use crate::opt::{optimize, prune_dead_blocks};
use crate::stack_layout::alloc_stack_variables_onto_stack_frame;
use crate::write::write_function;
use crate::CodegenResult;
use chert_ast::{Declaration, Diagnostics, Function, Module};

/// Per-translation-unit compilation driver.
#[derive(Default)]
pub struct Context {
    labels: LabelGen,
    strings: StringPool,
}

impl Context {
    /// Create a fresh context.
    pub fn new() -> Context {
        Default::default()
    }

    /// Run the machine-independent and allocation passes for one function.
    /// Returns `None` for prototypes and for functions with errors.
    pub fn compile_function(
        &mut self,
        func: &Function,
        isa: &dyn TargetIsa,
        diag: &mut Diagnostics,
    ) -> Option<FuncBackend> {
        let errors_before = diag.error_count();
        let mut fnbe = gen_defun(func, isa, diag, &mut self.labels, &mut self.strings)?;
        if diag.error_count() != errors_before {
            debug!("{}: skipped, lowering reported errors", func.name);
            return None;
        }

        optimize(&mut fnbe.ra, &mut fnbe.bbcon);
        prune_dead_blocks(&mut fnbe.bbcon);

        analyze_reg_flow(&mut fnbe.bbcon, &fnbe.ra);
        fnbe.ra.alloc_physical_registers(&fnbe.bbcon, isa);
        fnbe.ra.map_virtual_to_physical();
        fnbe.ra.detect_used_registers();
        {
            // Reborrow dance: the allocator rewrites the block container it
            // was fed, but the two live side by side in the backend record.
            let mut bbcon = std::mem::take(&mut fnbe.bbcon);
            fnbe.ra.insert_spill_code(&mut bbcon, isa);
            fnbe.bbcon = bbcon;
        }

        alloc_stack_variables_onto_stack_frame(func, &mut fnbe, isa);
        Some(fnbe)
    }

    /// Compile a whole module to assembly text.
    pub fn compile_module(
        &mut self,
        module: &Module,
        isa: &dyn TargetIsa,
        diag: &mut Diagnostics,
        out: &mut dyn Write,
    ) -> CodegenResult<()> {
        for decl in &module.decls {
            match decl {
                Declaration::DefFun(func) => {
                    if let Some(mut fnbe) = self.compile_function(func, isa, diag) {
                        isa.emit_function(out, func, &mut fnbe)?;
                    }
                }
                Declaration::VarDef(gvar) => {
                    isa.emit_global(out, gvar)?;
                }
            }
        }
        for (label, bytes) in self.strings.entries().to_vec() {
            isa.emit_rodata(out, &label, &bytes)?;
        }
        Ok(())
    }

    /// The IR-dump interface: compile each function and write the symbol
    /// table, vreg intervals and basic blocks in readable form.
    pub fn dump_module(
        &mut self,
        module: &Module,
        isa: &dyn TargetIsa,
        diag: &mut Diagnostics,
        out: &mut dyn Write,
    ) -> CodegenResult<()> {
        for decl in &module.decls {
            if let Declaration::DefFun(func) = decl {
                if let Some(fnbe) = self.compile_function(func, isa, diag) {
                    write_function(out, func, &fnbe)?;
                }
            }
        }
        Ok(())
    }
}
