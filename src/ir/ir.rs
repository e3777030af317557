//! Three-address IR organized as a control-flow graph of basic blocks.
//!
//! Blocks live in an arena owned by their `FlowGraph` and refer to each
//! other by `BlockId`; `next`/`prev` tie the blocks into a doubly linked
//! list (the textual order), `branch` is the optional jump target and the
//! fall-through successor is `next`. Value names are plain integers; a
//! name of -1 marks an erased instruction awaiting the compaction sweep.

use crate::common::fx_hash::FxHashMap;

pub type TypeId = i32;

pub const TYPE_VOID: TypeId = 0;
pub const TYPE_I64: TypeId = 1;
pub const TYPE_I32: TypeId = 2;
pub const TYPE_I8: TypeId = 3;
pub const TYPE_F64: TypeId = 4;
pub const TYPE_F32: TypeId = 5;
pub const TYPE_U64: TypeId = 6;
pub const TYPE_U32: TypeId = 7;
pub const TYPE_U8: TypeId = 8;
pub const TYPE_I16: TypeId = 9;
pub const TYPE_U16: TypeId = 10;
pub const TYPE_BOOLEAN: TypeId = 11;
pub const TYPE_NULLPTR: TypeId = 12;
/// Type ids above this are user defined (pointers, arrays, objects).
pub const TYPE_OBJECT: TypeId = 13;

/// Operation code of an instruction. The set is closed; every middle-end
/// pass matches exhaustively on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Data
    Constant,
    Param,
    Phi,
    Copy,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    UnaryMinus,
    LeftShift,
    RightShift,
    Modulo,
    // Conversions
    SignExtend,
    ZeroExtend,
    BitwiseCast,
    Convert,
    // Memory
    Alloca,
    Malloc,
    Load,
    Store,
    Ptr,
    ElementPtr,
    LoadGlobal,
    StoreGlobal,
    // Control
    Cmp,
    Br,
    Call,
    Arg,
    Return,
}

/// Branch sub-code carried in the `left` slot of a `Br` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jump {
    Unconditional = 0,
    Equals = 1,
    NotEquals = 2,
    Less = 3,
    Greater = 4,
    GreaterEquals = 5,
    LessEquals = 6,
}

impl Jump {
    pub fn from_i32(value: i32) -> Jump {
        match value {
            0 => Jump::Unconditional,
            1 => Jump::Equals,
            2 => Jump::NotEquals,
            3 => Jump::Less,
            4 => Jump::Greater,
            5 => Jump::GreaterEquals,
            6 => Jump::LessEquals,
            _ => Jump::Unconditional,
        }
    }

    /// The jump taken when the condition is false, used when lowering
    /// `if`/`while` so the branch skips the body.
    pub fn inverted(self) -> Jump {
        match self {
            Jump::Unconditional => Jump::Unconditional,
            Jump::Equals => Jump::NotEquals,
            Jump::NotEquals => Jump::Equals,
            Jump::Less => Jump::GreaterEquals,
            Jump::Greater => Jump::LessEquals,
            Jump::GreaterEquals => Jump::Less,
            Jump::LessEquals => Jump::Greater,
        }
    }
}

/// A three-address instruction: `{name, type, left, right, imm, op}`.
///
/// For special instructions (`Constant`, `Call`, `Br`, `Param`, `Alloca`,
/// `Malloc`) the `left`/`right` slots are not value names: a constant
/// carries a pool id in `imm`, a call carries its argument count in `left`
/// and symbol id in `right`, a branch carries its `Jump` code in `left`,
/// a param carries its index in `imm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub name: i32,
    pub ty: TypeId,
    pub left: i32,
    pub right: i32,
    pub imm: i32,
    pub op: Op,
}

impl Instruction {
    pub fn new(name: i32, ty: TypeId, left: i32, right: i32, op: Op) -> Self {
        Self { name, ty, left, right, imm: 0, op }
    }

    pub fn with_imm(name: i32, ty: TypeId, imm: i32, op: Op) -> Self {
        Self { name, ty, left: -1, right: -1, imm, op }
    }

    pub fn with_offset(name: i32, ty: TypeId, left: i32, right: i32, offset: i32, op: Op) -> Self {
        Self { name, ty, left, right, imm: offset, op }
    }

    /// Special instructions do not treat `left`/`right` as value names.
    pub fn is_special(&self) -> bool {
        matches!(
            self.op,
            Op::Constant | Op::Call | Op::Br | Op::Param | Op::Alloca | Op::Malloc
        )
    }
}

/// Index of a basic block in its flow graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A phi pseudo-instruction. The operand list is kept positionally aligned
/// with the owning block's `incoming` list; any transformation that
/// reorders `incoming` must reorder the operands in lockstep.
#[derive(Debug, Clone)]
pub struct Phi {
    pub name: i32,
    pub ty: TypeId,
    pub values: Vec<i32>,
    pub blocks: Vec<BlockId>,
}

impl Phi {
    pub fn new(name: i32, ty: TypeId) -> Self {
        Self { name, ty, values: Vec::new(), blocks: Vec::new() }
    }

    pub fn add_value(&mut self, value: i32, block: BlockId) {
        self.values.push(value);
        self.blocks.push(block);
    }

    pub fn set_value(&mut self, index: usize, value: i32) {
        self.values[index] = value;
    }
}

/// An ordered sequence of instructions plus the phi records for the block.
///
/// Each phi is mirrored by an `Op::Phi` instruction at the front of the
/// instruction stream so that linear positions exist for liveness and the
/// register allocators; the side record holds the full operand list.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
    pub phis: Vec<Phi>,
    pub incoming: Vec<BlockId>,
    pub branch: Option<BlockId>,
    pub unconditional: bool,
    pub next: Option<BlockId>,
    pub prev: Option<BlockId>,
    removed: bool,
}

impl BasicBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instruction(&mut self, ins: Instruction) {
        self.instructions.push(ins);
    }

    pub fn insert_instruction(&mut self, index: usize, ins: Instruction) {
        self.instructions.insert(index, ins);
    }

    pub fn remove_instruction(&mut self, index: usize) {
        self.instructions.remove(index);
    }

    pub fn add_phi(&mut self, phi: Phi) {
        self.phis.push(phi);
    }

    pub fn add_incoming(&mut self, block: BlockId) {
        self.incoming.push(block);
    }

    pub fn remove_incoming(&mut self, block: BlockId) {
        self.incoming.retain(|&b| b != block);
    }

    /// Whether control can fall through to `next`. A block that ends in an
    /// unconditional branch or a return transfers control explicitly.
    pub fn has_fall_through(&self) -> bool {
        if self.branch.is_some() && self.unconditional {
            return false;
        }
        !matches!(self.instructions.last(), Some(ins) if ins.op == Op::Return)
    }
}

/// Flow graph of basic blocks for a single function. Owns the block arena;
/// removal leaves a tombstone so `BlockId`s stay stable.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    blocks: Vec<BasicBlock>,
    first: Option<BlockId>,
    last: Option<BlockId>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new block at the end of the textual order.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let mut bb = BasicBlock::new();
        bb.prev = self.last;
        self.blocks.push(bb);
        match self.last {
            Some(last) => self.blocks[last.index()].next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        id
    }

    /// Insert a new block into the textual order immediately after
    /// `insert_after`.
    pub fn insert_after(&mut self, insert_after: BlockId) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let next = self.blocks[insert_after.index()].next;
        let mut bb = BasicBlock::new();
        bb.prev = Some(insert_after);
        bb.next = next;
        self.blocks.push(bb);
        self.blocks[insert_after.index()].next = Some(id);
        match next {
            Some(next) => self.blocks[next.index()].prev = Some(id),
            None => self.last = Some(id),
        }
        id
    }

    /// Unlink a block from the textual order. The arena slot survives as a
    /// tombstone; `incoming` edges must already have been cleaned up.
    pub fn remove_block(&mut self, id: BlockId) {
        let (prev, next) = {
            let bb = &self.blocks[id.index()];
            (bb.prev, bb.next)
        };
        match prev {
            Some(prev) => self.blocks[prev.index()].next = next,
            None => self.first = next,
        }
        match next {
            Some(next) => self.blocks[next.index()].prev = prev,
            None => self.last = prev,
        }
        let bb = &mut self.blocks[id.index()];
        bb.removed = true;
        bb.next = None;
        bb.prev = None;
        bb.instructions.clear();
        bb.phis.clear();
        bb.incoming.clear();
        bb.branch = None;
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        let bb = &self.blocks[id.index()];
        debug_assert!(!bb.removed, "access to removed block {}", id);
        bb
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        let bb = &mut self.blocks[id.index()];
        debug_assert!(!bb.removed, "access to removed block {}", id);
        bb
    }

    pub fn first(&self) -> Option<BlockId> {
        self.first
    }

    pub fn last(&self) -> Option<BlockId> {
        self.last
    }

    /// Number of live (non-removed) blocks.
    pub fn num_blocks(&self) -> usize {
        self.block_order().len()
    }

    /// Block ids in textual order, following the `next` links from the
    /// entry block.
    pub fn block_order(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut cur = self.first;
        while let Some(id) = cur {
            order.push(id);
            cur = self.blocks[id.index()].next;
        }
        order
    }

    pub fn set_branch(&mut self, block: BlockId, target: Option<BlockId>, unconditional: bool) {
        let bb = &mut self.blocks[block.index()];
        bb.branch = target;
        bb.unconditional = target.is_some() && unconditional;
    }

    /// Successors of a block: the branch target plus the fall-through.
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        let bb = &self.blocks[id.index()];
        let mut succ = Vec::with_capacity(2);
        if bb.has_fall_through() {
            if let Some(next) = bb.next {
                succ.push(next);
            }
        }
        if let Some(branch) = bb.branch {
            if !succ.contains(&branch) {
                succ.push(branch);
            }
        }
        succ
    }

    /// Rebuild every block's `incoming` list from the links, preserving
    /// the invariant that `B ∈ T.incoming` iff `T` is `B.next` reached by
    /// fall-through or `B.branch`. Phi operands are realigned to the new
    /// incoming order.
    pub fn recompute_incoming(&mut self) {
        let order = self.block_order();
        let mut incoming: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &id in &order {
            for succ in self.successors(id) {
                incoming.entry(succ).or_default().push(id);
            }
        }
        for &id in &order {
            let new_incoming = incoming.remove(&id).unwrap_or_default();
            let bb = &mut self.blocks[id.index()];
            let old_incoming = std::mem::replace(&mut bb.incoming, new_incoming.clone());
            if bb.phis.is_empty() || old_incoming == new_incoming {
                continue;
            }
            for phi in &mut bb.phis {
                let mut values = Vec::with_capacity(new_incoming.len());
                let mut blocks = Vec::with_capacity(new_incoming.len());
                for &pred in &new_incoming {
                    if let Some(pos) = phi.blocks.iter().position(|&b| b == pred) {
                        values.push(phi.values[pos]);
                        blocks.push(pred);
                    }
                }
                phi.values = values;
                phi.blocks = blocks;
            }
        }
    }

    /// The compaction sweep: remove every instruction whose name was set
    /// to -1 by a pass, along with phi records erased the same way.
    /// Scheduled at safe points only, never mid-traversal.
    pub fn compact(&mut self) {
        let order = self.block_order();
        for id in order {
            let bb = &mut self.blocks[id.index()];
            bb.instructions.retain(|ins| ins.name != -1);
            bb.phis.retain(|phi| phi.name != -1);
        }
    }

    /// Total number of instructions across live blocks.
    pub fn num_instructions(&self) -> usize {
        self.block_order()
            .iter()
            .map(|&id| self.block(id).instructions.len())
            .sum()
    }

    /// The highest value name in use, for seeding fresh-name counters.
    pub fn max_name(&self) -> i32 {
        let mut max = 0;
        for id in self.block_order() {
            for ins in &self.block(id).instructions {
                max = max.max(ins.name);
            }
            for phi in &self.block(id).phis {
                max = max.max(phi.name);
            }
        }
        max
    }
}

/// A stable reference to an instruction: its block, its absolute position
/// in the linearized function, and the position of the block's first
/// instruction. The adjusted position indexes into the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionRef {
    pub block: BlockId,
    pub pos: i32,
    pub base_pos: i32,
}

impl InstructionRef {
    pub fn new(block: BlockId, pos: i32, base_pos: i32) -> Self {
        Self { block, pos, base_pos }
    }

    pub fn adjusted(&self) -> usize {
        (self.pos - self.base_pos) as usize
    }
}

bitflags::bitflags! {
    /// Function attributes from the declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionAttributes: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const EXTERN = 0x4;
    }
}

/// Calling convention tag on a function. Only the x86-64 conventions are
/// supported; the System-V vs Windows split is decided by the target at
/// lowering time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    X86_64,
}

/// A function under compilation. Created by the AST lowerer, mutated by
/// every middle-end pass, consumed by the back end.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub full_name: String,
    pub arity: usize,
    pub attributes: FunctionAttributes,
    pub call_convention: CallConvention,
    pub cfg: FlowGraph,
    pub args: Vec<TypeId>,
    pub ret_type: TypeId,
    /// Pre-SSA variable names: candidate names that may be defined more
    /// than once and need phi insertion.
    pub variables: Vec<i32>,
    pub can_inline: bool,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        full_name: impl Into<String>,
        arity: usize,
        attributes: FunctionAttributes,
    ) -> Self {
        Self {
            name: name.into(),
            full_name: full_name.into(),
            arity,
            attributes,
            call_convention: CallConvention::X86_64,
            cfg: FlowGraph::new(),
            args: Vec::new(),
            ret_type: TYPE_VOID,
            variables: Vec::new(),
            can_inline: false,
        }
    }

    pub fn has_attribute(&self, attribute: FunctionAttributes) -> bool {
        self.attributes.contains(attribute)
    }

    pub fn add_variable(&mut self, name: i32) {
        self.variables.push(name);
    }

    pub fn add_argument(&mut self, ty: TypeId) {
        self.args.push(ty);
    }
}

/// A named type. Primitives occupy the low ids; pointer and array types
/// are derived on demand and refer back to their base type.
#[derive(Debug, Clone)]
pub struct Type {
    pub id: TypeId,
    pub base_type: TypeId,
    pub name: String,
    pub size: i32,
    pub is_pointer: bool,
    pub is_array: bool,
}

impl Type {
    pub fn new(id: TypeId, base_type: TypeId, name: impl Into<String>, size: i32) -> Self {
        Self {
            id,
            base_type,
            name: name.into(),
            size,
            is_pointer: false,
            is_array: false,
        }
    }
}

/// A constant value, uniqued by primitive type and value in the pool.
/// Floats are keyed by bit pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    I64(i64),
    U64(u64),
    I32(i32),
    U32(u32),
    I16(i16),
    U16(u16),
    I8(i8),
    U8(u8),
    F64(f64),
    F32(f32),
    Str(String),
}

impl Constant {
    /// The constant widened to 64 bits for immediate emission.
    pub fn as_i64(&self) -> i64 {
        match self {
            Constant::I64(v) => *v,
            Constant::U64(v) => *v as i64,
            Constant::I32(v) => *v as i64,
            Constant::U32(v) => *v as i64,
            Constant::I16(v) => *v as i64,
            Constant::U16(v) => *v as i64,
            Constant::I8(v) => *v as i64,
            Constant::U8(v) => *v as i64,
            Constant::F64(v) => v.to_bits() as i64,
            Constant::F32(v) => v.to_bits() as i64,
            Constant::Str(_) => 0,
        }
    }
}

/// Value-uniqued constant pool.
#[derive(Debug, Default)]
pub struct ConstantPool {
    constants: Vec<Constant>,
    i64_map: FxHashMap<i64, i32>,
    u64_map: FxHashMap<u64, i32>,
    i32_map: FxHashMap<i32, i32>,
    u32_map: FxHashMap<u32, i32>,
    i16_map: FxHashMap<i16, i32>,
    u16_map: FxHashMap<u16, i32>,
    i8_map: FxHashMap<i8, i32>,
    u8_map: FxHashMap<u8, i32>,
    f64_map: FxHashMap<u64, i32>,
    f32_map: FxHashMap<u32, i32>,
    str_map: FxHashMap<String, i32>,
}

macro_rules! intern_fn {
    ($fn_name:ident, $map:ident, $ty:ty, $variant:ident) => {
        pub fn $fn_name(&mut self, value: $ty) -> i32 {
            if let Some(&id) = self.$map.get(&value) {
                return id;
            }
            let id = self.constants.len() as i32;
            self.constants.push(Constant::$variant(value));
            self.$map.insert(value, id);
            id
        }
    };
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    intern_fn!(intern_i64, i64_map, i64, I64);
    intern_fn!(intern_u64, u64_map, u64, U64);
    intern_fn!(intern_i32, i32_map, i32, I32);
    intern_fn!(intern_u32, u32_map, u32, U32);
    intern_fn!(intern_i16, i16_map, i16, I16);
    intern_fn!(intern_u16, u16_map, u16, U16);
    intern_fn!(intern_i8, i8_map, i8, I8);
    intern_fn!(intern_u8, u8_map, u8, U8);

    pub fn intern_f64(&mut self, value: f64) -> i32 {
        if let Some(&id) = self.f64_map.get(&value.to_bits()) {
            return id;
        }
        let id = self.constants.len() as i32;
        self.constants.push(Constant::F64(value));
        self.f64_map.insert(value.to_bits(), id);
        id
    }

    pub fn intern_f32(&mut self, value: f32) -> i32 {
        if let Some(&id) = self.f32_map.get(&value.to_bits()) {
            return id;
        }
        let id = self.constants.len() as i32;
        self.constants.push(Constant::F32(value));
        self.f32_map.insert(value.to_bits(), id);
        id
    }

    pub fn intern_str(&mut self, value: &str) -> i32 {
        if let Some(&id) = self.str_map.get(value) {
            return id;
        }
        let id = self.constants.len() as i32;
        self.constants.push(Constant::Str(value.to_string()));
        self.str_map.insert(value.to_string(), id);
        id
    }

    /// The zero constant for a primitive type.
    pub fn intern_zero(&mut self, ty: TypeId) -> i32 {
        match ty {
            TYPE_I64 => self.intern_i64(0),
            TYPE_U64 => self.intern_u64(0),
            TYPE_I32 => self.intern_i32(0),
            TYPE_U32 => self.intern_u32(0),
            TYPE_I16 => self.intern_i16(0),
            TYPE_U16 => self.intern_u16(0),
            TYPE_I8 => self.intern_i8(0),
            TYPE_U8 | TYPE_BOOLEAN => self.intern_u8(0),
            TYPE_F64 => self.intern_f64(0.0),
            TYPE_F32 => self.intern_f32(0.0),
            _ => self.intern_i64(0),
        }
    }

    pub fn get(&self, id: i32) -> &Constant {
        &self.constants[id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &Constant)> {
        self.constants.iter().enumerate().map(|(i, c)| (i as i32, c))
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

/// A namespace groups functions, types, and static variables by index
/// into the module's tables.
#[derive(Debug, Default)]
pub struct Namespace {
    pub name: String,
    pub functions: Vec<usize>,
    pub types: Vec<TypeId>,
    pub static_variables: Vec<usize>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

/// A namespace-level static variable, materialized in initialized data.
#[derive(Debug, Clone)]
pub struct StaticVariable {
    pub ty: TypeId,
    pub name: String,
    pub constant_id: i32,
}

impl StaticVariable {
    pub fn new(ty: TypeId, name: impl Into<String>, constant_id: i32) -> Self {
        Self { ty, name: name.into(), constant_id }
    }
}

/// The compilation unit: owns all functions, types, constants, symbols,
/// namespaces, and static variables. Passes mutate functions in place.
#[derive(Debug, Default)]
pub struct Module {
    pub types: Vec<Type>,
    pub functions: Vec<Function>,
    pub namespaces: Vec<Namespace>,
    pub static_variables: Vec<StaticVariable>,
    pub constants: ConstantPool,
    symbols: FxHashMap<i32, String>,
    symbol_ids: FxHashMap<String, i32>,
    pointer_types: FxHashMap<TypeId, TypeId>,
    array_types: FxHashMap<TypeId, TypeId>,
    type_names: FxHashMap<String, TypeId>,
}

impl Module {
    pub fn new() -> Self {
        let mut module = Self::default();
        module.add_primitives();
        module
    }

    fn add_primitives(&mut self) {
        let primitives: [(TypeId, &str, i32); 13] = [
            (TYPE_VOID, "void", 0),
            (TYPE_I64, "i64", 8),
            (TYPE_I32, "i32", 4),
            (TYPE_I8, "i8", 1),
            (TYPE_F64, "f64", 8),
            (TYPE_F32, "f32", 4),
            (TYPE_U64, "u64", 8),
            (TYPE_U32, "u32", 4),
            (TYPE_U8, "u8", 1),
            (TYPE_I16, "i16", 2),
            (TYPE_U16, "u16", 2),
            (TYPE_BOOLEAN, "bool", 1),
            (TYPE_NULLPTR, "nullptr", 8),
        ];
        for (id, name, size) in primitives {
            debug_assert_eq!(id as usize, self.types.len());
            self.types.push(Type::new(id, id, name, size));
            self.type_names.insert(name.to_string(), id);
        }
        // Reserve the TYPE_OBJECT slot so user type ids start above it.
        self.types.push(Type::new(TYPE_OBJECT, TYPE_OBJECT, "object", 0));
    }

    pub fn add_symbol(&mut self, symbol: &str) -> i32 {
        if let Some(&id) = self.symbol_ids.get(symbol) {
            return id;
        }
        let id = self.symbols.len() as i32;
        self.symbols.insert(id, symbol.to_string());
        self.symbol_ids.insert(symbol.to_string(), id);
        id
    }

    pub fn get_symbol(&self, id: i32) -> Option<&str> {
        self.symbols.get(&id).map(|s| s.as_str())
    }

    pub fn add_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    pub fn add_static_variable(&mut self, variable: StaticVariable) -> usize {
        self.static_variables.push(variable);
        self.static_variables.len() - 1
    }

    pub fn get_type_from_name(&self, name: &str) -> Option<TypeId> {
        self.type_names.get(name).copied()
    }

    pub fn type_of(&self, id: TypeId) -> &Type {
        &self.types[id as usize]
    }

    /// The pointer type deriving from `base_type`, created on first use.
    pub fn get_pointer_type(&mut self, base_type: TypeId) -> TypeId {
        if let Some(&id) = self.pointer_types.get(&base_type) {
            return id;
        }
        let id = self.types.len() as TypeId;
        let name = format!("{}*", self.types[base_type as usize].name);
        let mut ty = Type::new(id, base_type, name, 8);
        ty.is_pointer = true;
        self.types.push(ty);
        self.pointer_types.insert(base_type, id);
        id
    }

    /// The array type deriving from `base_type`, created on first use.
    pub fn get_array_type(&mut self, base_type: TypeId) -> TypeId {
        if let Some(&id) = self.array_types.get(&base_type) {
            return id;
        }
        let id = self.types.len() as TypeId;
        let name = format!("{}[]", self.types[base_type as usize].name);
        let mut ty = Type::new(id, base_type, name, 8);
        ty.is_array = true;
        self.types.push(ty);
        self.array_types.insert(base_type, id);
        id
    }

    pub fn find_function(&self, full_name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.full_name == full_name)
    }

    /// Human-readable listing of every function's CFG.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for function in &self.functions {
            if function.has_attribute(FunctionAttributes::EXTERN) {
                let _ = writeln!(out, "extern fn {}", function.full_name);
                continue;
            }
            let _ = writeln!(out, "fn {}", function.full_name);
            for id in function.cfg.block_order() {
                let bb = function.cfg.block(id);
                let _ = writeln!(out, "  {}:", id);
                for phi in &bb.phis {
                    let operands: Vec<String> = phi
                        .values
                        .iter()
                        .zip(&phi.blocks)
                        .map(|(v, b)| format!("%{} from {}", v, b))
                        .collect();
                    let _ = writeln!(out, "    %{} = phi {}", phi.name, operands.join(", "));
                }
                for ins in &bb.instructions {
                    if ins.op == Op::Phi {
                        continue;
                    }
                    let _ = writeln!(
                        out,
                        "    %{} = {:?} ty={} left={} right={} imm={}",
                        ins.name, ins.op, ins.ty, ins.left, ins.right, ins.imm
                    );
                }
                if let Some(branch) = bb.branch {
                    let kind = if bb.unconditional { "jmp" } else { "br" };
                    let _ = writeln!(out, "    {} {}", kind, branch);
                }
            }
        }
        out
    }
}

/// Whether a type is held in an SSE register (floats) or a general
/// purpose register (everything else addressable).
pub fn is_float_type(ty: TypeId) -> bool {
    ty == TYPE_F32 || ty == TYPE_F64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_order_follows_links() {
        let mut cfg = FlowGraph::new();
        let a = cfg.add_block();
        let b = cfg.add_block();
        let c = cfg.insert_after(a);
        assert_eq!(cfg.block_order(), vec![a, c, b]);
        assert_eq!(cfg.first(), Some(a));
        assert_eq!(cfg.last(), Some(b));
    }

    #[test]
    fn test_remove_block_relinks() {
        let mut cfg = FlowGraph::new();
        let a = cfg.add_block();
        let b = cfg.add_block();
        let c = cfg.add_block();
        cfg.remove_block(b);
        assert_eq!(cfg.block_order(), vec![a, c]);
        assert_eq!(cfg.block(c).prev, Some(a));
        assert_eq!(cfg.block(a).next, Some(c));
    }

    #[test]
    fn test_successors_fall_through_and_branch() {
        let mut cfg = FlowGraph::new();
        let a = cfg.add_block();
        let b = cfg.add_block();
        let c = cfg.add_block();
        cfg.set_branch(a, Some(c), false);
        assert_eq!(cfg.successors(a), vec![b, c]);

        cfg.set_branch(a, Some(c), true);
        cfg.block_mut(a)
            .add_instruction(Instruction::new(0, TYPE_VOID, Jump::Unconditional as i32, -1, Op::Br));
        assert_eq!(cfg.successors(a), vec![c]);
    }

    #[test]
    fn test_recompute_incoming() {
        let mut cfg = FlowGraph::new();
        let a = cfg.add_block();
        let b = cfg.add_block();
        let c = cfg.add_block();
        cfg.set_branch(a, Some(c), false);
        cfg.recompute_incoming();
        assert_eq!(cfg.block(b).incoming, vec![a]);
        assert_eq!(cfg.block(c).incoming, vec![a, b]);
    }

    #[test]
    fn test_compact_removes_erased() {
        let mut cfg = FlowGraph::new();
        let a = cfg.add_block();
        cfg.block_mut(a).add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(a).add_instruction(Instruction::with_imm(-1, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(a).add_instruction(Instruction::new(1, TYPE_I64, 0, 0, Op::Add));
        cfg.compact();
        assert_eq!(cfg.block(a).instructions.len(), 2);
        assert!(cfg.block(a).instructions.iter().all(|ins| ins.name != -1));
    }

    #[test]
    fn test_constant_pool_uniques_values() {
        let mut pool = ConstantPool::new();
        let a = pool.intern_i64(42);
        let b = pool.intern_i64(42);
        let c = pool.intern_i64(43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Same value, different primitive type: distinct slots.
        let d = pool.intern_i32(42);
        assert_ne!(a, d);
        assert_eq!(pool.get(a), &Constant::I64(42));
    }

    #[test]
    fn test_pointer_type_interning() {
        let mut module = Module::new();
        let p1 = module.get_pointer_type(TYPE_I64);
        let p2 = module.get_pointer_type(TYPE_I64);
        assert_eq!(p1, p2);
        assert!(module.type_of(p1).is_pointer);
        assert_eq!(module.type_of(p1).base_type, TYPE_I64);
        assert!(p1 > TYPE_OBJECT);
    }

    #[test]
    fn test_special_instructions() {
        assert!(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant).is_special());
        assert!(Instruction::new(0, TYPE_VOID, 0, -1, Op::Br).is_special());
        assert!(!Instruction::new(0, TYPE_I64, 1, 2, Op::Add).is_special());
        assert!(!Instruction::new(0, TYPE_I64, 1, 2, Op::Phi).is_special());
    }
}
