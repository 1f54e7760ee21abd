//! Human-readable dump of a compiled function's backend state.
//!
//! The dump shows the symbol table (locals with their vreg or stack
//! offset), the vreg pool with live intervals and allocation results, and
//! every basic block with its label, predecessors, liveness sets, and
//! instructions in three-address form. It is a debugging aid and doubles as
//! the stable ordering contract: blocks print in emission order and
//! instructions carry their linear index.

use std::io::{self, Write};

use chert_entity::EntityRef;

use crate::ir::{BinaryOp, FuncBackend, Inst, LocalSlot, UnaryOp, VReg, VRegFlags};
use crate::regalloc::IntervalState;
use chert_ast::Function;

fn fmt_vreg(fnbe: &FuncBackend, v: VReg) -> String {
    let data = &fnbe.ra.vregs[v];
    if data.is_const() {
        return format!("({})", data.fixed);
    }
    if let Some(phys) = data.phys {
        let class = if data.is_flonum() { 'F' } else { 'R' };
        static SIZES: [&str; 4] = ["b", "w", "d", ""];
        return format!("{}{}{}<{}>", class, phys, SIZES[data.size.index()], v);
    }
    if data.version == 0 {
        return format!("V{}", v.index());
    }
    if data.version <= 26 {
        let letter = (b'a' + (data.version - 1) as u8) as char;
        format!("v{}{}({})", data.orig.index(), letter, v.index())
    } else {
        format!("v{}_{}({})", data.orig.index(), data.version, v.index())
    }
}

fn fmt_set(title: &str, set: &chert_entity::EntitySet<VReg>) -> String {
    let mut s = format!(" {}=[", title);
    for (i, v) in set.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&v.index().to_string());
    }
    s.push(']');
    s
}

fn binop_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "ADD",
        BinaryOp::Sub => "SUB",
        BinaryOp::Mul => "MUL",
        BinaryOp::Div => "DIV",
        BinaryOp::Mod => "MOD",
        BinaryOp::BitAnd => "BITAND",
        BinaryOp::BitOr => "BITOR",
        BinaryOp::BitXor => "BITXOR",
        BinaryOp::LShift => "LSHIFT",
        BinaryOp::RShift => "RSHIFT",
    }
}

fn binop_text(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
        BinaryOp::LShift => "<<",
        BinaryOp::RShift => ">>",
    }
}

fn write_inst(out: &mut dyn Write, fnbe: &FuncBackend, inst: &Inst) -> io::Result<()> {
    let v = |x: VReg| fmt_vreg(fnbe, x);
    match inst {
        Inst::FrameAddr { dst, frame, offset } => {
            let total = frame.offset() as i64 + offset;
            let sign = if total >= 0 { '+' } else { '-' };
            writeln!(out, "BOFS\t{} = &[bp {} {}]", v(*dst), sign, total.abs())
        }
        Inst::LabelAddr { dst, label, offset } => {
            if *offset != 0 {
                writeln!(out, "IOFS\t{} = &{} {:+}", v(*dst), label, offset)
            } else {
                writeln!(out, "IOFS\t{} = &{}", v(*dst), label)
            }
        }
        Inst::StackAddr { dst, offset } => {
            writeln!(out, "SOFS\t{} = &[sp + {}]", v(*dst), fnbe.ra.vregs[*offset].fixed)
        }
        Inst::Load { dst, addr } => writeln!(out, "LOAD\t{} = [{}]", v(*dst), v(*addr)),
        Inst::LoadSpill { dst, src } => {
            writeln!(out, "LOAD_S\t{} = [v{}]", v(*dst), src.index())
        }
        Inst::Store { addr, src } => writeln!(out, "STORE\t[{}] = {}", v(*addr), v(*src)),
        Inst::StoreSpill { dst, src } => {
            writeln!(out, "STORE_S\t[v{}] = {}", dst.index(), v(*src))
        }
        Inst::Binary {
            op,
            dst,
            lhs,
            rhs,
            flags,
        } => {
            let u = if matches!(op, BinaryOp::Div | BinaryOp::Mod)
                && flags.contains(crate::ir::IrFlags::UNSIGNED)
            {
                "U"
            } else {
                ""
            };
            writeln!(
                out,
                "{}{}\t{} = {} {} {}",
                binop_name(*op),
                u,
                v(*dst),
                v(*lhs),
                binop_text(*op),
                v(*rhs)
            )
        }
        Inst::Unary { op, dst, src } => {
            let (name, sym) = match op {
                UnaryOp::Neg => ("NEG", "-"),
                UnaryOp::BitNot => ("BITNOT", "~"),
            };
            writeln!(out, "{}\t{} = {}{}", name, v(*dst), sym, v(*src))
        }
        Inst::SetCond { cc, dst, lhs, rhs } => {
            writeln!(out, "COND\t{} = {} {} {}", v(*dst), v(*lhs), cc, v(*rhs))
        }
        Inst::Branch { cc, lhs, rhs, dest } => {
            let label = &fnbe.bbcon.blocks[*dest].label;
            match (lhs, rhs) {
                (Some(l), Some(r)) => {
                    writeln!(out, "J{}\t{}, {}, {}", cc, v(*l), v(*r), label)
                }
                _ => writeln!(out, "JMP\t{}", label),
            }
        }
        Inst::BranchTable { index, targets } => {
            write!(out, "TJMP\t{}", v(*index))?;
            for (i, t) in targets.iter().enumerate() {
                let sep = if i == 0 { ", [" } else { ", " };
                write!(out, "{}{}", sep, fnbe.bbcon.blocks[*t].label)?;
            }
            writeln!(out, "]")
        }
        Inst::PreCall { .. } => writeln!(out, "PRECALL"),
        Inst::PushArg { index, src } => writeln!(out, "PUSHARG\t{}, {}", index, v(*src)),
        Inst::Call {
            dst,
            target,
            reg_arg_count,
            ..
        } => {
            if let Some(d) = dst {
                write!(out, "CALL\t{} = ", v(*d))?;
            } else {
                write!(out, "CALL\t")?;
            }
            match target {
                crate::ir::CallTarget::Label(label) => {
                    writeln!(out, "{}(args=#{})", label, reg_arg_count)
                }
                crate::ir::CallTarget::Reg(r) => {
                    writeln!(out, "*{}(args=#{})", v(*r), reg_arg_count)
                }
            }
        }
        Inst::Result { dst, src } => match dst {
            Some(d) => writeln!(out, "RESULT\t{} = {}", v(*d), v(*src)),
            None => writeln!(out, "RESULT\t{}", v(*src)),
        },
        Inst::SubSp { amount } => writeln!(out, "SUBSP\t{}", v(*amount)),
        Inst::Cast { dst, src, .. } => writeln!(out, "CAST\t{} = {}", v(*dst), v(*src)),
        Inst::Mov { dst, src } => writeln!(out, "MOV\t{} = {}", v(*dst), v(*src)),
        Inst::Keep { dst, opr1, opr2 } => {
            write!(out, "KEEP\t")?;
            if let Some(d) = dst {
                write!(out, "dst:{}, ", v(*d))?;
            }
            if let Some(o1) = opr1 {
                write!(out, "{}", v(*o1))?;
                if let Some(o2) = opr2 {
                    write!(out, ", {}", v(*o2))?;
                }
            }
            writeln!(out)
        }
        Inst::Phi { dst, args } => {
            write!(out, "PHI\t{} = [", v(*dst))?;
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    write!(out, ", ")?;
                }
                write!(out, "{}", v(*a))?;
            }
            writeln!(out, "]")
        }
        Inst::Asm { text } => writeln!(out, "ASM\t\"{}\"", text),
    }
}

/// Write the full per-function dump.
pub fn write_function(
    out: &mut dyn Write,
    func: &Function,
    fnbe: &FuncBackend,
) -> io::Result<()> {
    writeln!(out, "### {}\n", func.name)?;

    writeln!(out, "params and locals:")?;
    for local in &fnbe.locals {
        match &local.slot {
            LocalSlot::Reg(v) => {
                let data = &fnbe.ra.vregs[*v];
                writeln!(
                    out,
                    "  V{:3} (flag={:x}): {}",
                    v.index(),
                    data.flags.bits(),
                    local.name
                )?;
            }
            LocalSlot::Frame(fi) => {
                writeln!(
                    out,
                    "  stack (offset={:4}, size={}): {}",
                    fi.offset(),
                    local.size,
                    local.name
                )?;
            }
        }
    }

    writeln!(out, "VREG: #{}", fnbe.ra.vregs.len())?;
    for &idx in &fnbe.ra.sorted {
        let li = &fnbe.ra.intervals[idx];
        let data = &fnbe.ra.vregs[li.virt];
        match li.state {
            IntervalState::Normal => {
                let class = if data.is_flonum() { 'F' } else { 'R' };
                write!(
                    out,
                    "  V{:3} (flag={:x}): live {:3} - {:3}, => {}{:3}",
                    li.virt.index(),
                    data.flags.bits(),
                    li.start,
                    li.end,
                    class,
                    li.phys.map(|p| p as i32).unwrap_or(-1)
                )?;
                if li.occupied != 0 {
                    write!(out, ", occupied={:x}", li.occupied)?;
                }
                writeln!(out)?;
            }
            IntervalState::Spill => {
                writeln!(
                    out,
                    "  V{:3} (flag={:x}): live {:3} - {:3} (spilled, offset={})",
                    li.virt.index(),
                    data.flags.bits(),
                    li.start,
                    li.end,
                    data.offset
                )?;
            }
        }
    }

    writeln!(out, "BB: #{}", fnbe.bbcon.order.len())?;
    let mut nip = 0;
    for (i, &bb) in fnbe.bbcon.order.iter().enumerate() {
        let block = &fnbe.bbcon.blocks[bb];
        writeln!(out, "// BB {}", i)?;
        write!(out, "{}:", block.label)?;
        if !block.preds.is_empty() {
            write!(out, " from=[")?;
            for (j, p) in block.preds.iter().enumerate() {
                if j > 0 {
                    write!(out, ", ")?;
                }
                write!(out, "{}", fnbe.bbcon.blocks[*p].label)?;
            }
            write!(out, "]")?;
        }
        if !block.in_regs.is_empty() {
            write!(out, "{}", fmt_set("in", &block.in_regs))?;
        }
        if !block.out_regs.is_empty() {
            write!(out, "{}", fmt_set("out", &block.out_regs))?;
        }
        writeln!(out)?;
        for inst in &block.insts {
            write!(out, "{:6}|\t", nip)?;
            write_inst(out, fnbe, inst)?;
            nip += 1;
        }
    }
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{VRegFlags as VF, VRegSize};

    #[test]
    fn vreg_formats() {
        let mut fnbe = FuncBackend::default();
        let c = fnbe.ra.constant(123, VRegSize::B32);
        assert_eq!(fmt_vreg(&fnbe, c), "(123)");

        let plain = fnbe.ra.new_vreg(VRegSize::B32, VF::empty());
        assert_eq!(fmt_vreg(&fnbe, plain), "V1");

        let versioned = fnbe.ra.with_version(plain, 2);
        assert_eq!(fmt_vreg(&fnbe, versioned), "v1b(2)");

        let mut alloc = fnbe.ra.new_vreg(VRegSize::B64, VF::empty());
        fnbe.ra.vregs[alloc].phys = Some(3);
        assert_eq!(fmt_vreg(&fnbe, alloc), "R3<v3>");
        alloc = fnbe.ra.new_vreg(VRegSize::B8, VF::FLONUM);
        fnbe.ra.vregs[alloc].phys = Some(0);
        assert_eq!(fmt_vreg(&fnbe, alloc), "F0b<v4>");
    }
}
