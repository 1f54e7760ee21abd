//! Stack-frame layout.
//!
//! Offsets are relative to the frame pointer. Stack-passed parameters sit
//! above it at positive offsets fixed by the calling convention; everything
//! this pass assigns is below it at negative offsets:
//!
//! - the va-arg register save area, when the function is variadic;
//! - address-taken locals, packed in declaration order with natural
//!   alignment;
//! - one spill slot per SPILLED vreg, sized by the vreg's size class.
//!
//! The resulting `frame_size` covers everything above; the emitter appends
//! the outgoing-argument work area and pads the total to the ABI call
//! alignment when the function makes calls or modifies the stack.

use log::debug;

use crate::ir::{FuncBackend, VRegFlags};
use crate::isa::TargetIsa;
use crate::regalloc::RegAllocFlags;
use chert_ast::Function;

fn align_to(v: i64, align: i64) -> i64 {
    debug_assert!(align > 0);
    (v + align - 1) & !(align - 1)
}

/// Assign frame offsets to spilled vregs and address-taken locals and
/// compute the function's frame size.
pub fn alloc_stack_variables_onto_stack_frame(
    func: &Function,
    fnbe: &mut FuncBackend,
    isa: &dyn TargetIsa,
) {
    let mut cursor: i64 = 0;

    if func.ty.vaargs {
        cursor -= isa.vaarg_save_area_size() as i64;
        fnbe.vaarg_frame
            .set_offset(isa.vaarg_start_offset(fnbe.ireg_param_count));
    }

    // Address-taken locals and aggregates, in per-scope declaration order.
    for local in &fnbe.locals {
        if let crate::ir::LocalSlot::Frame(fi) = &local.slot {
            if fi.offset() != 0 {
                continue; // stack-passed parameter, already placed
            }
            let size = local.size.max(1) as i64;
            let align = local.align.max(1) as i64;
            cursor = -align_to(-cursor + size, align);
            fi.set_offset(cursor as i32);
        }
    }

    // Spill slots.
    let mut spills = 0;
    for data in fnbe.ra.vregs.values_mut() {
        if !data.flags.contains(VRegFlags::SPILLED) || data.offset != 0 {
            continue;
        }
        let size = data.size.bytes() as i64;
        cursor = -align_to(-cursor + size, size);
        data.offset = cursor as i32;
        spills += 1;
    }

    let word = isa.pointer_size() as i64;
    fnbe.frame_size = align_to(-cursor, word);
    if fnbe.frame_size > 0 {
        fnbe.ra.flags |= RegAllocFlags::STACK_FRAME;
    }

    // The placeholder for the outgoing-argument area size can be resolved
    // now that nothing will grow it further.
    if let Some(v) = fnbe.stack_work_size_vreg {
        fnbe.ra.vregs[v].fixed = fnbe.stack_work_size;
    }

    debug!(
        "{}: frame_size={} stack_work={} spills={}",
        func.name, fnbe.frame_size, fnbe.stack_work_size, spills
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FrameInfo, FuncBackend, LocalSlot, LocalVar, VRegFlags, VRegSize};
    use crate::isa;
    use chert_ast::{FuncType, Function, Storage, Type};
    use chert_entity::PrimaryMap;
    use std::rc::Rc;

    fn dummy_func(vaargs: bool) -> Function {
        Function {
            name: "f".into(),
            ty: Rc::new(FuncType {
                ret: Type::Void,
                params: Vec::new(),
                vaargs,
            }),
            params: Vec::new(),
            scopes: PrimaryMap::new(),
            body: None,
            storage: Storage::empty(),
            flags: Default::default(),
        }
    }

    #[test]
    fn locals_pack_downward_with_alignment() {
        let isa = isa::x64::X64Backend::new();
        let mut fnbe = FuncBackend::default();
        let a = FrameInfo::new(); // char, 1 byte
        let b = FrameInfo::new(); // long, 8 bytes
        fnbe.locals.push(LocalVar {
            var: None,
            name: "a".into(),
            slot: LocalSlot::Frame(a.clone()),
            size: 1,
            align: 1,
        });
        fnbe.locals.push(LocalVar {
            var: None,
            name: "b".into(),
            slot: LocalSlot::Frame(b.clone()),
            size: 8,
            align: 8,
        });
        let spilled = fnbe.ra.new_vreg(VRegSize::B32, VRegFlags::SPILLED);

        alloc_stack_variables_onto_stack_frame(&dummy_func(false), &mut fnbe, &isa);

        assert_eq!(a.offset(), -1);
        assert_eq!(b.offset(), -16);
        assert_eq!(fnbe.ra.vregs[spilled].offset, -20);
        assert_eq!(fnbe.frame_size % 8, 0);
        assert!(fnbe.frame_size >= 20);
    }

    #[test]
    fn vaarg_area_reserved_below_frame_pointer() {
        use crate::isa::TargetIsa;
        let isa = isa::x64::X64Backend::new();
        let mut fnbe = FuncBackend::default();
        fnbe.ireg_param_count = 1;
        alloc_stack_variables_onto_stack_frame(&dummy_func(true), &mut fnbe, &isa);
        assert!(fnbe.frame_size >= isa.vaarg_save_area_size() as i64);
        assert!(fnbe.vaarg_frame.offset() < 0);
        // The save area keeps one slot per unnamed register argument.
        assert_eq!(isa.vaarg_start_offset(1), -104);
    }
}
