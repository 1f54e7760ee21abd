//! Intermediate representation entities: virtual registers, basic blocks,
//! frame locations, and the per-function backend record.
//!
//! Entity references are `u32` new-types indexing arenas owned by the
//! function being compiled; basic blocks refer to each other (and to their
//! predecessors) through these indices, never through owning handles.

mod inst;

pub use self::inst::{
    BinaryOp, CallTarget, CondCode, CondKind, Inst, IrFlags, UnaryOp,
};

use std::cell::Cell;
use std::rc::Rc;

use chert_ast::{Name, VarId};
use chert_entity::{entity_impl, EntitySet, PrimaryMap};

/// An opaque reference to a virtual register. The index is the `virt` id;
/// SSA versions of one source-level value are separate `VReg`s sharing an
/// `orig` in their [`VRegData`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "v");

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "bb");

/// A physical register number within its class (integer or floating point).
pub type PhysReg = u8;

/// A bit mask over physical registers of one class.
pub type RegBits = u64;

/// Operand size classes carried by virtual registers.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum VRegSize {
    /// 8-bit.
    B8,
    /// 16-bit.
    B16,
    /// 32-bit.
    B32,
    /// 64-bit.
    B64,
}

impl VRegSize {
    /// The size class covering a value of `bytes` bytes.
    pub fn from_bytes(bytes: usize) -> VRegSize {
        match bytes {
            0 | 1 => VRegSize::B8,
            2 => VRegSize::B16,
            3 | 4 => VRegSize::B32,
            _ => VRegSize::B64,
        }
    }

    /// Size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            VRegSize::B8 => 1,
            VRegSize::B16 => 2,
            VRegSize::B32 => 4,
            VRegSize::B64 => 8,
        }
    }

    /// Index into per-size tables (0..4).
    pub fn index(self) -> usize {
        match self {
            VRegSize::B8 => 0,
            VRegSize::B16 => 1,
            VRegSize::B32 => 2,
            VRegSize::B64 => 3,
        }
    }
}

bitflags::bitflags! {
    /// Virtual register attributes.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct VRegFlags: u8 {
        /// The vreg is a constant; it has no liveness and no physical
        /// register.
        const CONST = 1 << 0;
        /// Floating point class.
        const FLONUM = 1 << 1;
        /// Demoted to a stack slot by the register allocator.
        const SPILLED = 1 << 2;
        /// Function parameter, live from function entry.
        const PARAM = 1 << 3;
        /// Address-taken value: bypasses SSA and register allocation.
        const REF = 1 << 4;
        /// Unsigned interpretation.
        const UNSIGNED = 1 << 5;
    }
}

/// Payload of one virtual register.
#[derive(Clone, Debug)]
pub struct VRegData {
    /// Size class.
    pub size: VRegSize,
    /// Attribute flags.
    pub flags: VRegFlags,
    /// SSA version; 0 before SSA construction and for seed versions.
    pub version: u32,
    /// The pre-versioning vreg this one descends from (itself if original).
    pub orig: VReg,
    /// Assigned physical register, absent until allocation (and always
    /// absent for CONST and REF vregs).
    pub phys: Option<PhysReg>,
    /// Constant value, meaningful when `CONST` is set.
    pub fixed: i64,
    /// Frame offset of the spill slot, meaningful when `SPILLED` is set.
    pub offset: i32,
    /// ABI parameter position for `PARAM` vregs.
    pub param: Option<u8>,
}

impl VRegData {
    /// Is this vreg a foldable constant?
    pub fn is_const(&self) -> bool {
        self.flags.contains(VRegFlags::CONST)
    }

    /// Does this vreg take part in liveness and allocation?
    pub fn is_allocatable(&self) -> bool {
        !self.flags.intersects(VRegFlags::CONST | VRegFlags::REF)
    }

    /// Floating point register class?
    pub fn is_flonum(&self) -> bool {
        self.flags.contains(VRegFlags::FLONUM)
    }
}

/// A named stack location whose offset from the frame pointer is resolved
/// after register allocation. Shared between the instruction that takes the
/// address and the frame-layout pass, hence the interior mutability.
#[derive(Clone, Debug, Default)]
pub struct FrameInfo(Rc<Cell<i32>>);

impl FrameInfo {
    /// A new, unresolved frame location.
    pub fn new() -> FrameInfo {
        Default::default()
    }

    /// A frame location with a known offset (stack-passed parameters).
    pub fn at(offset: i32) -> FrameInfo {
        let fi = FrameInfo::new();
        fi.set_offset(offset);
        fi
    }

    /// Current offset; 0 until resolved.
    pub fn offset(&self) -> i32 {
        self.0.get()
    }

    /// Resolve the offset.
    pub fn set_offset(&self, offset: i32) {
        self.0.set(offset)
    }
}

/// One basic block: straight-line instructions ended by at most one branch.
#[derive(Clone, Debug)]
pub struct BlockData {
    /// Unique assembly label.
    pub label: String,
    /// Instructions in order. A branch only appears last.
    pub insts: Vec<Inst>,
    /// Predecessor blocks, by index into the container.
    pub preds: Vec<Block>,
    /// Live-in vregs (liveness product).
    pub in_regs: EntitySet<VReg>,
    /// Live-out vregs (liveness product).
    pub out_regs: EntitySet<VReg>,
    /// Vregs written anywhere in the block.
    pub assigned_regs: EntitySet<VReg>,
}

impl BlockData {
    fn new(label: String) -> BlockData {
        BlockData {
            label,
            insts: Vec::new(),
            preds: Vec::new(),
            in_regs: EntitySet::new(),
            out_regs: EntitySet::new(),
            assigned_regs: EntitySet::new(),
        }
    }
}

/// The ordered sequence of basic blocks forming one function body.
///
/// Emission order equals creation order; the first block is the entry.
#[derive(Clone, Debug, Default)]
pub struct BlockContainer {
    /// Block arena.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Blocks in creation (and emission) order.
    pub order: Vec<Block>,
}

impl BlockContainer {
    /// Create an empty container.
    pub fn new() -> BlockContainer {
        Default::default()
    }

    /// Allocate a new empty block without placing it; forward branches can
    /// target it before it is appended.
    pub fn create_block(&mut self, label: String) -> Block {
        self.blocks.push(BlockData::new(label))
    }

    /// Place a created block at the end of the emission order.
    pub fn append_block(&mut self, bb: Block) {
        debug_assert!(!self.order.contains(&bb));
        self.order.push(bb);
    }

    /// Allocate a new empty block and place it immediately.
    pub fn add_block(&mut self, label: String) -> Block {
        let bb = self.create_block(label);
        self.order.push(bb);
        bb
    }

    /// The entry block.
    pub fn entry(&self) -> Option<Block> {
        self.order.first().copied()
    }

    /// The block following `bb` in emission order, if any.
    pub fn next_of(&self, bb: Block) -> Option<Block> {
        let pos = self.order.iter().position(|&b| b == bb)?;
        self.order.get(pos + 1).copied()
    }

    /// Successors of `bb`. A block may end in a *group* of branches (a
    /// conditional jump followed by the unconditional one); every branch in
    /// the trailing group contributes an edge, plus the fall-through block
    /// when the last instruction doesn't transfer unconditionally.
    pub fn succs(&self, bb: Block) -> Vec<Block> {
        let mut out = Vec::new();
        let data = &self.blocks[bb];
        let mut falls_through = true;
        for inst in &data.insts[self.branch_group_start(bb)..] {
            match inst {
                Inst::Branch { cc, dest, .. } => {
                    if !out.contains(dest) {
                        out.push(*dest);
                    }
                    falls_through = cc.kind != CondKind::Any;
                }
                Inst::BranchTable { targets, .. } => {
                    for &t in targets {
                        if !out.contains(&t) {
                            out.push(t);
                        }
                    }
                    falls_through = false;
                }
                _ => {}
            }
        }
        if falls_through {
            if let Some(next) = self.next_of(bb) {
                if !out.contains(&next) {
                    out.push(next);
                }
            }
        }
        out
    }

    /// Index of the first instruction of the trailing branch group.
    pub fn branch_group_start(&self, bb: Block) -> usize {
        let insts = &self.blocks[bb].insts;
        let mut at = insts.len();
        while at > 0 && insts[at - 1].is_branch() {
            at -= 1;
        }
        at
    }

    /// Recompute every block's predecessor list from the branch structure.
    pub fn compute_preds(&mut self) {
        let order = self.order.clone();
        for &bb in &order {
            self.blocks[bb].preds.clear();
        }
        for &bb in &order {
            for succ in self.succs(bb) {
                if !self.blocks[succ].preds.contains(&bb) {
                    self.blocks[succ].preds.push(bb);
                }
            }
        }
    }
}

/// Where a local variable ended up.
#[derive(Clone, Debug)]
pub enum LocalSlot {
    /// Kept as a value in a virtual register.
    Reg(VReg),
    /// Lives in the stack frame (address-taken or aggregate).
    Frame(FrameInfo),
}

/// Dump/debug record tying a source variable to its backend location.
#[derive(Clone, Debug)]
pub struct LocalVar {
    /// Variable id in the AST; `None` for compiler-introduced slots.
    pub var: Option<VarId>,
    /// Source name.
    pub name: Name,
    /// Where it lives.
    pub slot: LocalSlot,
    /// Byte size, for frame packing and the dump.
    pub size: usize,
    /// Natural alignment in bytes.
    pub align: usize,
}

/// Where a register-passed parameter must land in the prologue.
#[derive(Clone, Debug)]
pub enum ParamDest {
    /// Into the vreg the allocator picked (or its spill slot).
    Reg(VReg),
    /// Into a frame slot: the parameter's address is taken, so all reads
    /// go through memory.
    Frame(FrameInfo),
}

/// How one register-class parameter lands in the function body.
#[derive(Clone, Debug)]
pub struct RegParamInfo {
    /// Position among parameters of the same class (selects the ABI
    /// argument register).
    pub index: u8,
    /// Floating point class?
    pub flonum: bool,
    /// Value size class.
    pub size: VRegSize,
    /// Landing place.
    pub dest: ParamDest,
}

/// Per-function backend state: everything the passes produce and the
/// emitter consumes. Discarded when the function has been emitted.
#[derive(Debug, Default)]
pub struct FuncBackend {
    /// The function body as basic blocks.
    pub bbcon: BlockContainer,
    /// Register allocator state and the vreg pool.
    pub ra: crate::regalloc::RegAlloc,
    /// Frame bytes for spills, locals and the va-arg save area.
    pub frame_size: i64,
    /// Extra frame bytes for outgoing stack arguments.
    pub stack_work_size: i64,
    /// Placeholder constant vreg holding `stack_work_size`; its value is
    /// fixed up once the size is known, just before emission.
    pub stack_work_size_vreg: Option<VReg>,
    /// The va-arg register save area, for `__builtin_va_start`.
    pub vaarg_frame: FrameInfo,
    /// Register parameters in ABI order, for the prologue landing code.
    pub reg_params: Vec<RegParamInfo>,
    /// Frame locations of stack-passed parameters; their provisional
    /// offsets get rebased once the prologue's save count is known.
    pub stack_params: Vec<FrameInfo>,
    /// Number of integer parameters passed in registers.
    pub ireg_param_count: usize,
    /// Number of floating point parameters passed in registers.
    pub freg_param_count: usize,
    /// Number of call sites in the body.
    pub funcall_count: usize,
    /// Source variables and their backend locations, for the IR dump.
    pub locals: Vec<LocalVar>,
}

impl BlockContainer {
    /// Walk `(block, inst)` pairs in emission order.
    pub fn inst_iter(&self) -> impl Iterator<Item = (Block, &Inst)> {
        self.order
            .iter()
            .flat_map(move |&bb| self.blocks[bb].insts.iter().map(move |i| (bb, i)))
    }
}
