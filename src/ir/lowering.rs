//! AST to IR lowering.
//!
//! Produces the pre-SSA shape the middle end expects: every local is an
//! `Alloca` of a pointer type, reads and writes go through `Ptr` plus
//! `Load`/`Store`, statics through `LoadGlobal`/`StoreGlobal`, array
//! elements through `ElementPtr`, calls are a `Call` followed by its
//! `Arg` run, and conditionals lower to `Cmp` plus an inverted `Br` that
//! skips the taken path. Declared locals are registered as variables on
//! the function so SSA construction knows the candidate set.

use crate::common::fx_hash::FxHashMap;
use crate::frontend::ast::*;
use crate::ir::builder::Builder;
use crate::ir::ir::*;
use tracing::debug;

pub fn lower_program(program: &Program, module: &mut Module) {
    let mut lowerer = Lowerer::new(module);
    lowerer.register_declarations(program);
    lowerer.lower_bodies(program);
}

#[derive(Debug, Clone)]
struct FunctionInfo {
    index: usize,
    full_name: String,
    symbol: i32,
    params: Vec<TypeId>,
    ret: TypeId,
}

#[derive(Debug, Clone, Copy)]
struct Local {
    name: i32,
    ty: TypeId,
    is_array: bool,
    is_param: bool,
}

struct Lowerer<'a> {
    builder: Builder<'a>,
    functions: FxHashMap<String, FunctionInfo>,
    statics: FxHashMap<String, (i32, TypeId)>,
}

struct FnState {
    cfg: FlowGraph,
    bb: BlockId,
    locals: FxHashMap<String, Local>,
    variables: Vec<i32>,
    ret_ty: TypeId,
    terminated: bool,
}

impl<'a> Lowerer<'a> {
    fn new(module: &'a mut Module) -> Self {
        Self {
            builder: Builder::new(module),
            functions: FxHashMap::default(),
            statics: FxHashMap::default(),
        }
    }

    fn register_declarations(&mut self, program: &Program) {
        for namespace_decl in &program.namespaces {
            let mut namespace = Namespace::new(namespace_decl.name.clone());

            for static_decl in &namespace_decl.statics {
                let full = format!("{}::{}", namespace_decl.name, static_decl.name);
                let constant_id = match &static_decl.init {
                    Some(Expr::IntLiteral(value, _)) => {
                        self.intern_int(static_decl.ty, *value)
                    }
                    Some(Expr::FloatLiteral(value, _)) => {
                        if static_decl.ty == TYPE_F32 {
                            self.builder.module.constants.intern_f32(*value as f32)
                        } else {
                            self.builder.module.constants.intern_f64(*value)
                        }
                    }
                    Some(Expr::BoolLiteral(value, _)) => {
                        self.builder.module.constants.intern_u8(*value as u8)
                    }
                    _ => -1,
                };
                let index = self
                    .builder
                    .module
                    .add_static_variable(StaticVariable::new(static_decl.ty, full, constant_id));
                namespace.static_variables.push(index);
                self.statics
                    .insert(static_decl.name.clone(), (index as i32, static_decl.ty));
            }

            for decl in &namespace_decl.functions {
                let full = format!("{}::{}", namespace_decl.name, decl.name);
                let symbol = self.builder.module.add_symbol(&full);
                let attributes = if decl.is_extern {
                    FunctionAttributes::EXTERN
                } else if decl.name == "main" {
                    FunctionAttributes::PUBLIC
                } else {
                    FunctionAttributes::PRIVATE
                };
                let mut function =
                    Function::new(decl.name.clone(), full.clone(), decl.params.len(), attributes);
                function.ret_type = decl.ret;
                for param in &decl.params {
                    function.add_argument(param.ty);
                }
                let index = self.builder.module.add_function(function);
                namespace.functions.push(index);
                self.functions.insert(
                    decl.name.clone(),
                    FunctionInfo {
                        index,
                        full_name: full,
                        symbol,
                        params: decl.params.iter().map(|p| p.ty).collect(),
                        ret: decl.ret,
                    },
                );
            }

            self.builder.module.namespaces.push(namespace);
        }
    }

    fn lower_bodies(&mut self, program: &Program) {
        for namespace_decl in &program.namespaces {
            for decl in &namespace_decl.functions {
                if decl.is_extern {
                    continue;
                }
                let info = self.functions[&decl.name].clone();
                let state = self.lower_function(decl);
                let function = &mut self.builder.module.functions[info.index];
                function.cfg = state.cfg;
                function.variables = state.variables;
                debug!(
                    function = %info.full_name,
                    blocks = function.cfg.num_blocks(),
                    instructions = function.cfg.num_instructions(),
                    "lowered"
                );
            }
        }
    }

    fn lower_function(&mut self, decl: &FunctionDecl) -> FnState {
        self.builder.reset();
        let mut state = FnState {
            cfg: FlowGraph::new(),
            bb: BlockId(0),
            locals: FxHashMap::default(),
            variables: Vec::new(),
            ret_ty: decl.ret,
            terminated: false,
        };
        let entry = state.cfg.add_block();
        state.bb = entry;

        for (index, param) in decl.params.iter().enumerate() {
            let name = self
                .builder
                .emit_param(&mut state.cfg, entry, param.ty, index as i32);
            state.locals.insert(
                param.name.clone(),
                Local { name, ty: param.ty, is_array: false, is_param: true },
            );
        }

        self.lower_block_stmts(&mut state, &decl.body);

        if !state.terminated {
            self.builder.emit_return(&mut state.cfg, state.bb, TYPE_VOID, -1);
        }

        remove_unreachable(&mut state.cfg);
        state.cfg.recompute_incoming();
        state
    }

    fn lower_block_stmts(&mut self, state: &mut FnState, block: &Block) {
        for stmt in &block.stmts {
            if state.terminated {
                // Anything after a return lands in an unreachable block
                // that the cleanup below removes.
                state.bb = state.cfg.add_block();
                state.terminated = false;
            }
            self.lower_stmt(state, stmt);
        }
    }

    fn lower_stmt(&mut self, state: &mut FnState, stmt: &Stmt) {
        match stmt {
            Stmt::Decl { ty, array_size, name, init, .. } => {
                if let Some(size) = array_size {
                    let array_ty = self.builder.module.get_array_type(*ty);
                    let alloca =
                        self.builder
                            .emit_alloca(&mut state.cfg, state.bb, array_ty, *size as i32);
                    state.locals.insert(
                        name.clone(),
                        Local { name: alloca, ty: *ty, is_array: true, is_param: false },
                    );
                    return;
                }
                let ptr_ty = self.builder.module.get_pointer_type(*ty);
                let alloca = self.builder.emit_alloca(&mut state.cfg, state.bb, ptr_ty, 1);
                state.variables.push(alloca);
                state.locals.insert(
                    name.clone(),
                    Local { name: alloca, ty: *ty, is_array: false, is_param: false },
                );
                if let Some(init) = init {
                    let (value, _) = self.lower_expr(state, init, Some(*ty));
                    let ptr = self.builder.emit_ptr(&mut state.cfg, state.bb, ptr_ty, alloca, 0);
                    self.builder.emit_store(&mut state.cfg, state.bb, *ty, ptr, value);
                }
            }
            Stmt::Assign { name, value, .. } => {
                if let Some(local) = state.locals.get(name).copied() {
                    let (value, _) = self.lower_expr(state, value, Some(local.ty));
                    let ptr_ty = self.builder.module.get_pointer_type(local.ty);
                    let ptr =
                        self.builder.emit_ptr(&mut state.cfg, state.bb, ptr_ty, local.name, 0);
                    self.builder.emit_store(&mut state.cfg, state.bb, local.ty, ptr, value);
                } else if let Some(&(global, ty)) = self.statics.get(name) {
                    let (value, _) = self.lower_expr(state, value, Some(ty));
                    self.builder
                        .emit_store_global(&mut state.cfg, state.bb, ty, value, global);
                }
            }
            Stmt::AssignIndex { name, index, value, .. } => {
                let local = state.locals[name];
                let (index_value, _) = self.lower_expr(state, index, Some(TYPE_I64));
                let (value, _) = self.lower_expr(state, value, Some(local.ty));
                let ptr_ty = self.builder.module.get_pointer_type(local.ty);
                let element = self.builder.emit_element_ptr(
                    &mut state.cfg,
                    state.bb,
                    ptr_ty,
                    local.name,
                    index_value,
                );
                self.builder.emit_store(&mut state.cfg, state.bb, local.ty, element, value);
            }
            Stmt::If { cond, then_block, else_block, .. } => {
                let cond_bb = self.lower_cond_entry(state, cond);

                let then_bb = state.cfg.add_block();
                state.bb = then_bb;
                state.terminated = false;
                self.lower_block_stmts(state, then_block);
                let then_end = state.bb;
                let then_terminated = state.terminated;

                if let Some(else_block) = else_block {
                    let else_bb = state.cfg.add_block();
                    state.cfg.set_branch(cond_bb, Some(else_bb), false);
                    state.bb = else_bb;
                    state.terminated = false;
                    self.lower_block_stmts(state, else_block);

                    let end_bb = state.cfg.add_block();
                    if !then_terminated {
                        self.builder.emit_br(&mut state.cfg, then_end, Jump::Unconditional);
                        state.cfg.set_branch(then_end, Some(end_bb), true);
                    }
                    state.bb = end_bb;
                } else {
                    let end_bb = state.cfg.add_block();
                    state.cfg.set_branch(cond_bb, Some(end_bb), false);
                    state.bb = end_bb;
                }
                state.terminated = false;
            }
            Stmt::While { cond, body, .. } => {
                let header = state.cfg.add_block();
                state.bb = header;
                state.terminated = false;
                let cond_bb = self.lower_cond_entry(state, cond);

                let body_bb = state.cfg.add_block();
                state.bb = body_bb;
                self.lower_block_stmts(state, body);
                if !state.terminated {
                    self.builder.emit_br(&mut state.cfg, state.bb, Jump::Unconditional);
                    state.cfg.set_branch(state.bb, Some(header), true);
                }

                let end_bb = state.cfg.add_block();
                state.cfg.set_branch(cond_bb, Some(end_bb), false);
                state.bb = end_bb;
                state.terminated = false;
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(value) => {
                        let ret_ty = state.ret_ty;
                        let (name, ty) = self.lower_expr(state, value, Some(ret_ty));
                        self.builder.emit_return(&mut state.cfg, state.bb, ty, name);
                    }
                    None => {
                        self.builder.emit_return(&mut state.cfg, state.bb, TYPE_VOID, -1);
                    }
                }
                state.terminated = true;
            }
            Stmt::Expr { expr, .. } => {
                self.lower_expr(state, expr, None);
            }
        }
    }

    /// Lower a condition's compare and branch into the current block,
    /// returning that block so the caller can attach the false target.
    /// The branch is inverted: it is taken when the condition fails.
    fn lower_cond_entry(&mut self, state: &mut FnState, cond: &Cond) -> BlockId {
        let (left, left_ty) = self.lower_expr(state, &cond.left, None);
        let (right, _) = self.lower_expr(state, &cond.right, Some(left_ty));
        self.builder.emit_cmp(&mut state.cfg, state.bb, left, right);
        self.builder
            .emit_br(&mut state.cfg, state.bb, cond.op.jump().inverted());
        state.bb
    }

    fn intern_int(&mut self, ty: TypeId, value: i64) -> i32 {
        let constants = &mut self.builder.module.constants;
        match ty {
            TYPE_I8 => constants.intern_i8(value as i8),
            TYPE_I16 => constants.intern_i16(value as i16),
            TYPE_I32 => constants.intern_i32(value as i32),
            TYPE_U8 | TYPE_BOOLEAN => constants.intern_u8(value as u8),
            TYPE_U16 => constants.intern_u16(value as u16),
            TYPE_U32 => constants.intern_u32(value as u32),
            TYPE_U64 => constants.intern_u64(value as u64),
            _ => constants.intern_i64(value),
        }
    }

    fn lower_expr(
        &mut self,
        state: &mut FnState,
        expr: &Expr,
        expected: Option<TypeId>,
    ) -> (i32, TypeId) {
        match expr {
            Expr::IntLiteral(value, _) => {
                let ty = match expected {
                    Some(ty) if !is_float_type(ty) && ty != TYPE_VOID => ty,
                    _ => TYPE_I64,
                };
                let id = self.intern_int(ty, *value);
                (self.builder.emit_constant(&mut state.cfg, state.bb, ty, id), ty)
            }
            Expr::FloatLiteral(value, _) => {
                let ty = match expected {
                    Some(TYPE_F32) => TYPE_F32,
                    _ => TYPE_F64,
                };
                let id = if ty == TYPE_F32 {
                    self.builder.module.constants.intern_f32(*value as f32)
                } else {
                    self.builder.module.constants.intern_f64(*value)
                };
                (self.builder.emit_constant(&mut state.cfg, state.bb, ty, id), ty)
            }
            Expr::BoolLiteral(value, _) => {
                let id = self.builder.module.constants.intern_u8(*value as u8);
                (
                    self.builder.emit_constant(&mut state.cfg, state.bb, TYPE_BOOLEAN, id),
                    TYPE_BOOLEAN,
                )
            }
            Expr::Ident(name, _) => {
                if let Some(local) = state.locals.get(name).copied() {
                    if local.is_param {
                        return (local.name, local.ty);
                    }
                    let ptr_ty = self.builder.module.get_pointer_type(local.ty);
                    let ptr =
                        self.builder.emit_ptr(&mut state.cfg, state.bb, ptr_ty, local.name, 0);
                    let value = self.builder.emit_load(&mut state.cfg, state.bb, local.ty, ptr);
                    (value, local.ty)
                } else {
                    let (global, ty) = self.statics[name];
                    let value =
                        self.builder.emit_load_global(&mut state.cfg, state.bb, ty, global);
                    (value, ty)
                }
            }
            Expr::Index { name, index, .. } => {
                let local = state.locals[name];
                let (index_value, _) = self.lower_expr(state, index, Some(TYPE_I64));
                let ptr_ty = self.builder.module.get_pointer_type(local.ty);
                let element = self.builder.emit_element_ptr(
                    &mut state.cfg,
                    state.bb,
                    ptr_ty,
                    local.name,
                    index_value,
                );
                let value = self.builder.emit_load(&mut state.cfg, state.bb, local.ty, element);
                (value, local.ty)
            }
            Expr::Call { name, args, .. } => {
                let info = self.functions[name].clone();
                let mut values = Vec::with_capacity(args.len());
                for (arg, &param_ty) in args.iter().zip(&info.params) {
                    let (value, ty) = self.lower_expr(state, arg, Some(param_ty));
                    values.push((value, ty));
                }
                let call = self.builder.emit_call(
                    &mut state.cfg,
                    state.bb,
                    info.ret,
                    args.len() as i32,
                    info.symbol,
                );
                for (value, ty) in values {
                    self.builder.emit_arg(&mut state.cfg, state.bb, ty, value);
                }
                (call, info.ret)
            }
            Expr::Neg { operand, .. } => {
                let (value, ty) = self.lower_expr(state, operand, expected);
                (
                    self.builder.emit_unary_minus(&mut state.cfg, state.bb, ty, value),
                    ty,
                )
            }
            Expr::Binary { op, left, right, .. } => {
                let (left_value, ty) = self.lower_expr(state, left, expected);
                let (right_value, _) = self.lower_expr(state, right, Some(ty));
                let ir_op = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Modulo,
                    BinOp::Shl => Op::LeftShift,
                    BinOp::Shr => Op::RightShift,
                    BinOp::BitAnd => Op::And,
                    BinOp::BitOr => Op::Or,
                };
                (
                    self.builder
                        .emit_binop(&mut state.cfg, state.bb, ir_op, ty, left_value, right_value),
                    ty,
                )
            }
            Expr::Cast { ty, operand, .. } => {
                let (value, from) = self.lower_expr(state, operand, None);
                if from == *ty {
                    return (value, from);
                }
                let op = cast_op(self.builder.module, from, *ty);
                (
                    self.builder
                        .emit_conversion(&mut state.cfg, state.bb, op, *ty, from, value),
                    *ty,
                )
            }
        }
    }
}

/// Select the conversion opcode for a numeric cast.
fn cast_op(module: &Module, from: TypeId, to: TypeId) -> Op {
    let from_float = is_float_type(from);
    let to_float = is_float_type(to);
    if from_float || to_float {
        return Op::Convert;
    }
    let from_size = module.type_of(from).size;
    let to_size = module.type_of(to).size;
    if to_size > from_size {
        if matches!(from, TYPE_U8 | TYPE_U16 | TYPE_U32 | TYPE_U64 | TYPE_BOOLEAN) {
            Op::ZeroExtend
        } else {
            Op::SignExtend
        }
    } else {
        // Same size or narrowing: a plain bit reinterpretation.
        Op::BitwiseCast
    }
}

/// Drop blocks that cannot be reached from the entry block.
fn remove_unreachable(cfg: &mut FlowGraph) {
    let Some(entry) = cfg.first() else {
        return;
    };
    let mut reachable = vec![entry];
    let mut index = 0;
    while index < reachable.len() {
        let id = reachable[index];
        index += 1;
        for succ in cfg.successors(id) {
            if !reachable.contains(&succ) {
                reachable.push(succ);
            }
        }
    }
    for id in cfg.block_order() {
        if !reachable.contains(&id) {
            cfg.remove_block(id);
        }
    }
}
