//! Middle-end pass driver. The order is fixed: SSA construction, memory
//! promotion, dead-code elimination, copy propagation, inlining, then
//! DCE and copy propagation re-run until a fixed point. A pass that keeps
//! reporting changes past the iteration bound is a compiler bug and is
//! surfaced as an internal error instead of spinning.

pub mod copy_prop;
pub mod dce;
pub mod inline;
pub mod mem2reg;

use crate::common::error::{CompileError, CompileResult};
use crate::ir::ir::Module;
use crate::ssa;
use tracing::debug;

const MAX_FIXPOINT_ITERATIONS: usize = 50;

pub fn run_passes(module: &mut Module, opt_level: u32) -> CompileResult<()> {
    ssa::construct(module);
    mem2reg::run(module);

    let removed = dce::run(module);
    let folded = copy_prop::run(module);
    debug!(removed, folded, "initial cleanup");

    if opt_level >= 1 {
        inline::run(module)?;

        let mut iterations = 0;
        loop {
            let changed = dce::run(module) + copy_prop::run(module);
            if changed == 0 {
                break;
            }
            iterations += 1;
            if iterations > MAX_FIXPOINT_ITERATIONS {
                return Err(CompileError::Internal(
                    "cleanup passes failed to reach a fixed point".to_string(),
                ));
            }
        }
        debug!(iterations, "cleanup fixed point");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::*;

    #[test]
    fn test_run_passes_on_empty_module() {
        let mut module = Module::new();
        assert!(run_passes(&mut module, 2).is_ok());
    }

    #[test]
    fn test_run_passes_straight_line_function() {
        let mut module = Module::new();
        let mut function = Function::new("main", "T::main", 0, FunctionAttributes::PUBLIC);
        function.ret_type = TYPE_I64;
        let bb = function.cfg.add_block();
        let c = module.constants.intern_i64(7);
        let block = function.cfg.block_mut(bb);
        block.add_instruction(Instruction::with_imm(0, TYPE_I64, c, Op::Constant));
        block.add_instruction(Instruction::new(1, TYPE_I64, 0, 0, Op::Add));
        block.add_instruction(Instruction::new(2, TYPE_I64, 1, -1, Op::Return));
        module.add_function(function);

        assert!(run_passes(&mut module, 2).is_ok());
        let cfg = &module.functions[0].cfg;
        // Nothing was erased without being swept.
        for id in cfg.block_order() {
            for ins in &cfg.block(id).instructions {
                assert_ne!(ins.name, -1);
            }
        }
    }
}
