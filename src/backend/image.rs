//! Machine-code image assembly.
//!
//! Drives the per-function back-end pipeline (allocate, lower, encode,
//! patch) and publishes the writer boundary: a program-data byte vector,
//! an initialized-data vector with the materialized float/string
//! constants and static variables, the entry-point offset, extern-call
//! records, and the import set. All code is self-relative; `link`
//! resolves the RIP-relative data references once the writer has fixed
//! the section base addresses.

use crate::backend::x86::encoder::{CallSite, DataFixup};
use crate::backend::x86::lower::lower_function;
use crate::backend::x86::minst::{MBlock, MFunction, MInst, MOp, Operand, Width};
use crate::backend::x86::patch::assemble_function;
use crate::backend::x86::regs::{Reg, Target, TargetOs};
use crate::common::error::{CompileError, CompileResult};
use crate::common::fx_hash::FxHashMap;
use crate::ir::ir::{Constant, FunctionAttributes, Module};
use crate::regalloc::graph::GraphAllocator;
use crate::regalloc::linear::LinearAllocator;
use crate::regalloc::Allocator;
use crate::ssa;
use std::collections::BTreeMap;
use tracing::debug;

/// Layout of the initialized-data section: sign-mask constants for
/// floating-point negation, pooled float/double/string constants, and
/// static variables.
#[derive(Debug, Default)]
pub struct DataLayout {
    bytes: Vec<u8>,
    constant_offsets: FxHashMap<i32, i32>,
    static_offsets: FxHashMap<i32, i32>,
    f32_mask: i32,
    f64_mask: i32,
}

impl DataLayout {
    pub fn build(module: &Module) -> Self {
        let mut layout = DataLayout::default();

        // 16-byte aligned XOR masks for unary minus.
        layout.f32_mask = 0;
        for _ in 0..4 {
            layout.bytes.extend_from_slice(&0x8000_0000u32.to_le_bytes());
        }
        layout.f64_mask = layout.bytes.len() as i32;
        for _ in 0..2 {
            layout.bytes.extend_from_slice(&0x8000_0000_0000_0000u64.to_le_bytes());
        }

        for (id, constant) in module.constants.iter() {
            match constant {
                Constant::F32(value) => {
                    let offset = layout.bytes.len() as i32;
                    layout.bytes.extend_from_slice(&value.to_bits().to_le_bytes());
                    layout.constant_offsets.insert(id, offset);
                }
                Constant::F64(value) => {
                    layout.align(8);
                    let offset = layout.bytes.len() as i32;
                    layout.bytes.extend_from_slice(&value.to_bits().to_le_bytes());
                    layout.constant_offsets.insert(id, offset);
                }
                Constant::Str(value) => {
                    let offset = layout.bytes.len() as i32;
                    layout.bytes.extend_from_slice(value.as_bytes());
                    layout.bytes.push(0);
                    layout.constant_offsets.insert(id, offset);
                }
                _ => {}
            }
        }

        for (index, variable) in module.static_variables.iter().enumerate() {
            let size = module.type_of(variable.ty).size.max(1);
            layout.align(size.min(8));
            let offset = layout.bytes.len() as i32;
            let mut initial = vec![0u8; size as usize];
            if variable.constant_id != -1 {
                let value = module.constants.get(variable.constant_id).as_i64();
                let bytes = value.to_le_bytes();
                let count = initial.len().min(8);
                initial[..count].copy_from_slice(&bytes[..count]);
            }
            layout.bytes.extend_from_slice(&initial);
            layout.static_offsets.insert(index as i32, offset);
        }

        layout
    }

    fn align(&mut self, alignment: i32) {
        while self.bytes.len() as i32 % alignment != 0 {
            self.bytes.push(0);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn constant_offset(&self, id: i32) -> CompileResult<i32> {
        self.constant_offsets.get(&id).copied().ok_or_else(|| {
            CompileError::Internal(format!("constant {} not materialized in data", id))
        })
    }

    pub fn static_offset(&self, id: i32) -> CompileResult<i32> {
        self.static_offsets.get(&id).copied().ok_or_else(|| {
            CompileError::Internal(format!("static variable {} has no data slot", id))
        })
    }

    pub fn f32_sign_mask(&self) -> i32 {
        self.f32_mask
    }

    pub fn f64_sign_mask(&self) -> i32 {
        self.f64_mask
    }
}

/// An unresolved call into an import, handed to the container writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternCall {
    /// Offset of the rel32 field inside program data.
    pub offset: u32,
    pub symbol: String,
}

/// The emitted image, consumed by the PE and ELF writers.
#[derive(Debug, Default)]
pub struct Image {
    pub program_data: Vec<u8>,
    pub initialized_data: Vec<u8>,
    pub extern_calls: Vec<ExternCall>,
    /// Entry-point byte offset into program data.
    pub entry_point: i32,
    /// Imports grouped by library name.
    pub imports: BTreeMap<String, Vec<String>>,
    pub(crate) data_fixups: Vec<DataFixup>,
}

impl Image {
    /// Resolve the RIP-relative data references once the writer has
    /// placed both sections: the displacement at each fixup becomes
    /// `data_base + data_offset − (text_base + end_of_field)`.
    pub fn link(&mut self, text_base: u64, data_base: u64) {
        for fixup in &self.data_fixups {
            let disp = data_base as i64 + fixup.data_offset as i64
                - (text_base as i64 + fixup.offset as i64 + 4);
            self.program_data[fixup.offset..fixup.offset + 4]
                .copy_from_slice(&(disp as i32).to_le_bytes());
        }
    }
}

/// The entry stub: call `main`, then hand its return value to the host.
fn entry_stub(target: &Target, main_symbol: &str) -> MFunction {
    let mut mfunc = MFunction::new("_start");
    let mut block = MBlock::default();
    match target.os {
        TargetOs::Linux => {
            // The kernel enters with a 16-byte aligned stack; the call
            // itself produces the conventional frame alignment in main.
            block.insts.push(MInst::nullary(MOp::Call { symbol: main_symbol.to_string() }));
            block.insts.push(MInst::new(
                MOp::Mov,
                Width::B32,
                Operand::Gpr(Reg::Rdi),
                Operand::Gpr(Reg::Rax),
            ));
            block.insts.push(MInst::new(
                MOp::Mov,
                Width::B32,
                Operand::Gpr(Reg::Rax),
                Operand::Imm(60),
            ));
            block.insts.push(MInst::nullary(MOp::Syscall));
        }
        TargetOs::Windows => {
            block.insts.push(MInst::new(
                MOp::Sub,
                Width::B64,
                Operand::Gpr(Reg::Rsp),
                Operand::Imm(40),
            ));
            block.insts.push(MInst::nullary(MOp::Call { symbol: main_symbol.to_string() }));
            block.insts.push(MInst::new(
                MOp::Add,
                Width::B64,
                Operand::Gpr(Reg::Rsp),
                Operand::Imm(40),
            ));
            block.insts.push(MInst::nullary(MOp::Ret));
        }
    }
    mfunc.blocks.push(block);
    mfunc
}

/// Run the back end over every function and assemble the image.
pub fn generate(module: &mut Module, target: &Target, opt_level: u32) -> CompileResult<Image> {
    let data = DataLayout::build(module);
    let mut image = Image {
        initialized_data: data.bytes().to_vec(),
        entry_point: 0,
        ..Default::default()
    };

    let main_index = module
        .functions
        .iter()
        .position(|f| f.name == "main" && !f.has_attribute(FunctionAttributes::EXTERN))
        .ok_or_else(|| CompileError::UnresolvedSymbol("main".to_string()))?;
    let main_symbol = module.functions[main_index].full_name.clone();

    let mut offsets: FxHashMap<String, usize> = FxHashMap::default();
    let mut pending_calls: Vec<CallSite> = Vec::new();

    let stub = assemble_function(&entry_stub(target, &main_symbol))?;
    append_code(&mut image, &mut pending_calls, stub.bytes, stub.call_sites, stub.data_fixups);

    for index in 0..module.functions.len() {
        if module.functions[index].has_attribute(FunctionAttributes::EXTERN) {
            continue;
        }
        let mut cfg = std::mem::take(&mut module.functions[index].cfg);

        let mut allocator: Box<dyn Allocator> = if opt_level == 0 {
            // The linear allocator consumes phi-free code; the coloring
            // allocator destructs SSA itself after coalescing.
            ssa::destruct(&mut cfg);
            Box::new(LinearAllocator::new(target.register_file()))
        } else {
            Box::new(GraphAllocator::new(target.register_file()))
        };
        allocator.allocate(module, &mut cfg)?;

        let function = &module.functions[index];
        let mfunc = lower_function(module, function, &cfg, allocator.as_ref(), target, &data)?;
        let code = assemble_function(&mfunc)?;
        debug!(function = %function.full_name, bytes = code.bytes.len(), "encoded");

        offsets.insert(function.full_name.clone(), image.program_data.len());
        append_code(&mut image, &mut pending_calls, code.bytes, code.call_sites, code.data_fixups);

        module.functions[index].cfg = cfg;
    }

    image.entry_point = 0;
    patch_calls(module, target, &mut image, &offsets, pending_calls)?;
    Ok(image)
}

fn append_code(
    image: &mut Image,
    pending_calls: &mut Vec<CallSite>,
    bytes: Vec<u8>,
    call_sites: Vec<CallSite>,
    data_fixups: Vec<DataFixup>,
) {
    let base = image.program_data.len();
    image.program_data.extend_from_slice(&bytes);
    for mut site in call_sites {
        site.offset += base;
        pending_calls.push(site);
    }
    for mut fixup in data_fixups {
        fixup.offset += base;
        image.data_fixups.push(fixup);
    }
}

/// Resolve intra-module calls to function offsets; unknown symbols that
/// name extern functions become import records for the writer, anything
/// else is a patch error.
fn patch_calls(
    module: &Module,
    target: &Target,
    image: &mut Image,
    offsets: &FxHashMap<String, usize>,
    pending_calls: Vec<CallSite>,
) -> CompileResult<()> {
    for site in pending_calls {
        if let Some(&target_offset) = offsets.get(&site.symbol) {
            let disp = target_offset as i64 - (site.offset as i64 + 4);
            image.program_data[site.offset..site.offset + 4]
                .copy_from_slice(&(disp as i32).to_le_bytes());
            continue;
        }
        let is_extern = module
            .functions
            .iter()
            .any(|f| f.has_attribute(FunctionAttributes::EXTERN) && f.full_name == site.symbol)
            || site.symbol == "malloc";
        if !is_extern {
            return Err(CompileError::Patch(format!(
                "unresolved call symbol `{}`",
                site.symbol
            )));
        }
        image
            .imports
            .entry(target.default_import_library().to_string())
            .or_default()
            .push(site.symbol.clone());
        image.extern_calls.push(ExternCall { offset: site.offset as u32, symbol: site.symbol });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::*;

    fn simple_main(module: &mut Module, value: i64) {
        let constant = module.constants.intern_i64(value);
        let mut function = Function::new("main", "T::main", 0, FunctionAttributes::PUBLIC);
        function.ret_type = TYPE_I64;
        let bb = function.cfg.add_block();
        let b = function.cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, constant, Op::Constant));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Return));
        module.add_function(function);
    }

    #[test]
    fn test_generate_simple_image() {
        let mut module = Module::new();
        simple_main(&mut module, 0);
        let target = Target::new(TargetOs::Linux);
        let image = generate(&mut module, &target, 2).unwrap();
        assert!(!image.program_data.is_empty());
        assert_eq!(image.entry_point, 0);
        assert!(image.extern_calls.is_empty());
        // The stub leads with the call into main.
        assert_eq!(image.program_data[0], 0xE8);
        // mov edi, eax; mov eax, 60; syscall.
        assert_eq!(&image.program_data[5..7], &[0x89, 0xC7]);
        let has_syscall = image
            .program_data
            .windows(2)
            .any(|w| w == [0x0F, 0x05]);
        assert!(has_syscall);
    }

    #[test]
    fn test_generate_without_main_fails() {
        let mut module = Module::new();
        let target = Target::new(TargetOs::Linux);
        assert!(generate(&mut module, &target, 2).is_err());
    }

    #[test]
    fn test_intra_module_call_is_patched() {
        let mut module = Module::new();
        let symbol = module.add_symbol("T::helper");
        let constant = module.constants.intern_i64(7);

        let mut helper = Function::new("helper", "T::helper", 0, FunctionAttributes::PRIVATE);
        helper.ret_type = TYPE_I64;
        let bb = helper.cfg.add_block();
        let b = helper.cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, constant, Op::Constant));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Return));
        module.add_function(helper);

        let mut main = Function::new("main", "T::main", 0, FunctionAttributes::PUBLIC);
        main.ret_type = TYPE_I64;
        let bb = main.cfg.add_block();
        let b = main.cfg.block_mut(bb);
        b.add_instruction(Instruction::new(0, TYPE_I64, 0, symbol, Op::Call));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Return));
        module.add_function(main);

        let target = Target::new(TargetOs::Linux);
        // Opt level 0 keeps the call (no inlining).
        let image = generate(&mut module, &target, 0).unwrap();
        assert!(image.extern_calls.is_empty());
        assert!(!image.program_data.is_empty());
    }

    #[test]
    fn test_unresolved_call_is_patch_error() {
        let mut module = Module::new();
        let symbol = module.add_symbol("T::missing");
        let mut main = Function::new("main", "T::main", 0, FunctionAttributes::PUBLIC);
        main.ret_type = TYPE_I64;
        let bb = main.cfg.add_block();
        let b = main.cfg.block_mut(bb);
        b.add_instruction(Instruction::new(0, TYPE_I64, 0, symbol, Op::Call));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Return));
        module.add_function(main);

        let target = Target::new(TargetOs::Linux);
        let result = generate(&mut module, &target, 0);
        assert!(matches!(result, Err(CompileError::Patch(_))));
    }

    #[test]
    fn test_extern_call_becomes_import() {
        let mut module = Module::new();
        let symbol = module.add_symbol("T::getenv");
        let mut ext = Function::new("getenv", "T::getenv", 0, FunctionAttributes::EXTERN);
        ext.ret_type = TYPE_I64;
        module.add_function(ext);

        let mut main = Function::new("main", "T::main", 0, FunctionAttributes::PUBLIC);
        main.ret_type = TYPE_I64;
        let bb = main.cfg.add_block();
        let b = main.cfg.block_mut(bb);
        b.add_instruction(Instruction::new(0, TYPE_I64, 0, symbol, Op::Call));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Return));
        module.add_function(main);

        let target = Target::new(TargetOs::Linux);
        let image = generate(&mut module, &target, 0).unwrap();
        assert_eq!(image.extern_calls.len(), 1);
        assert_eq!(image.extern_calls[0].symbol, "T::getenv");
        assert_eq!(image.imports["libc.so.6"], vec!["T::getenv".to_string()]);
    }

    #[test]
    fn test_data_layout_offsets() {
        let mut module = Module::new();
        let pi = module.constants.intern_f64(3.25);
        module.add_static_variable(StaticVariable::new(TYPE_I64, "T::counter", -1));
        let layout = DataLayout::build(&module);
        // Masks first: 16 bytes each.
        assert_eq!(layout.f32_sign_mask(), 0);
        assert_eq!(layout.f64_sign_mask(), 16);
        let off = layout.constant_offset(pi).unwrap() as usize;
        assert_eq!(&layout.bytes()[off..off + 8], &3.25f64.to_bits().to_le_bytes());
        assert!(layout.static_offset(0).unwrap() >= 40);
    }

    #[test]
    fn test_link_resolves_rip_references() {
        let mut module = Module::new();
        let c = module.constants.intern_f64(1.5);
        let mut function = Function::new("main", "T::main", 0, FunctionAttributes::PUBLIC);
        function.ret_type = TYPE_F64;
        let bb = function.cfg.add_block();
        let b = function.cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_F64, c, Op::Constant));
        b.add_instruction(Instruction::new(1, TYPE_F64, 0, -1, Op::Return));
        module.add_function(function);

        let target = Target::new(TargetOs::Linux);
        let mut image = generate(&mut module, &target, 2).unwrap();
        assert!(!image.data_fixups.is_empty());
        let fixup = image.data_fixups[0];
        image.link(0x401000, 0x402000);
        let disp = i32::from_le_bytes(
            image.program_data[fixup.offset..fixup.offset + 4].try_into().unwrap(),
        );
        assert_eq!(
            disp as i64,
            0x402000 + fixup.data_offset as i64 - (0x401000 + fixup.offset as i64 + 4)
        );
    }
}
