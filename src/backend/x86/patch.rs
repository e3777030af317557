//! Jump patching and function assembly.
//!
//! Blocks are encoded in textual order with placeholder displacements,
//! starting from the 8-bit jump forms. After a layout pass every jump's
//! displacement is `target_offset − (site_offset + site_width)`; any
//! 8-bit site whose displacement overflows is widened to the 32-bit form
//! and the function is re-laid-out, until every displacement fits.

use crate::backend::x86::encoder::{CallSite, DataFixup, Encoder, JumpSite};
use crate::backend::x86::minst::MFunction;
use crate::common::error::{CompileError, CompileResult};
use crate::common::fx_hash::FxHashMap;
use crate::ir::ir::BlockId;

/// Encoded machine code for one function, with its unresolved call sites
/// and data fixups relative to the function start.
#[derive(Debug, Default)]
pub struct FunctionCode {
    pub bytes: Vec<u8>,
    pub call_sites: Vec<CallSite>,
    pub data_fixups: Vec<DataFixup>,
}

pub fn assemble_function(mfunc: &MFunction) -> CompileResult<FunctionCode> {
    let num_blocks = mfunc.blocks.len();
    let mut wide = vec![false; num_blocks];

    // Each widening strictly grows one site, so the loop is bounded by
    // the number of jumps.
    for _ in 0..=num_blocks + 1 {
        let mut encoder = Encoder::new();
        let mut offsets: FxHashMap<BlockId, usize> = FxHashMap::default();
        let mut sites: Vec<(usize, JumpSite, BlockId)> = Vec::new();

        for (index, block) in mfunc.blocks.iter().enumerate() {
            if let Some(id) = block.id {
                offsets.insert(id, encoder.pos());
            }
            for inst in &block.insts {
                encoder.encode(inst)?;
            }
            if let Some(jump) = &block.jump {
                let site = encoder.encode_jump(jump.jump, jump.unsigned, wide[index]);
                sites.push((index, site, jump.target));
            }
        }

        let mut widened = false;
        let mut patches: Vec<(JumpSite, i64)> = Vec::new();
        for &(index, site, target) in &sites {
            let Some(&target_offset) = offsets.get(&target) else {
                return Err(CompileError::Patch(format!(
                    "jump to unknown block {} in {}",
                    target, mfunc.name
                )));
            };
            let disp = target_offset as i64 - (site.disp_offset as i64 + site.width as i64);
            if site.width == 1 && !(-128..128).contains(&disp) {
                wide[index] = true;
                widened = true;
                continue;
            }
            patches.push((site, disp));
        }
        if widened {
            continue;
        }

        for (site, disp) in patches {
            let bytes = encoder.bytes_mut();
            if site.width == 1 {
                bytes[site.disp_offset] = disp as i8 as u8;
            } else {
                bytes[site.disp_offset..site.disp_offset + 4]
                    .copy_from_slice(&(disp as i32).to_le_bytes());
            }
        }
        let call_sites = encoder.call_sites.clone();
        let data_fixups = encoder.data_fixups.clone();
        return Ok(FunctionCode { bytes: encoder.finish(), call_sites, data_fixups });
    }
    Err(CompileError::Encoder(format!(
        "jump relaxation failed to converge in {}",
        mfunc.name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x86::minst::*;
    use crate::backend::x86::regs::Reg;
    use crate::ir::ir::Jump;

    fn mov_imm_block(id: u32, count: usize, jump: Option<MJump>) -> MBlock {
        let mut block = MBlock { id: Some(BlockId(id)), ..Default::default() };
        for _ in 0..count {
            block.insts.push(MInst::new(
                MOp::Mov,
                Width::B64,
                Operand::Gpr(Reg::Rax),
                Operand::Imm(1),
            ));
        }
        block.jump = jump;
        block
    }

    #[test]
    fn test_short_forward_jump() {
        let mut mfunc = MFunction::new("test");
        mfunc.blocks.push(mov_imm_block(
            0,
            0,
            Some(MJump { jump: Jump::Unconditional, unsigned: false, target: BlockId(1) }),
        ));
        mfunc.blocks.push(mov_imm_block(1, 1, None));
        mfunc.blocks.push(MBlock {
            id: Some(BlockId(2)),
            insts: vec![MInst::nullary(MOp::Ret)],
            jump: None,
        });

        let code = assemble_function(&mfunc).unwrap();
        // jmp +7 over one 7-byte mov: EB 07.
        assert_eq!(code.bytes[0], 0xEB);
        assert_eq!(code.bytes[1], 0x07);
    }

    #[test]
    fn test_backward_jump_displacement() {
        let mut mfunc = MFunction::new("test");
        mfunc.blocks.push(mov_imm_block(
            0,
            1,
            Some(MJump { jump: Jump::Unconditional, unsigned: false, target: BlockId(0) }),
        ));
        let code = assemble_function(&mfunc).unwrap();
        // 7-byte mov + EB disp: disp = 0 - 9 = -9.
        assert_eq!(code.bytes[7], 0xEB);
        assert_eq!(code.bytes[8], (-9i8) as u8);
    }

    #[test]
    fn test_jump_widens_when_block_grows() {
        // A forward jump over more than 127 bytes of code must widen to
        // the 32-bit form, shifting every later block offset.
        let mut mfunc = MFunction::new("test");
        mfunc.blocks.push(mov_imm_block(
            0,
            0,
            Some(MJump { jump: Jump::Equals, unsigned: false, target: BlockId(2) }),
        ));
        mfunc.blocks.push(mov_imm_block(1, 30, None)); // 210 bytes
        mfunc.blocks.push(MBlock {
            id: Some(BlockId(2)),
            insts: vec![MInst::nullary(MOp::Ret)],
            jump: None,
        });

        let code = assemble_function(&mfunc).unwrap();
        // Widened conditional: 0F 84 disp32.
        assert_eq!(code.bytes[0], 0x0F);
        assert_eq!(code.bytes[1], 0x84);
        let disp = i32::from_le_bytes([code.bytes[2], code.bytes[3], code.bytes[4], code.bytes[5]]);
        assert_eq!(disp, 210);
        // The target block offset accounts for the widened jump.
        assert_eq!(code.bytes[6 + 210], 0xC3);
    }

    #[test]
    fn test_mixed_narrow_and_wide() {
        let mut mfunc = MFunction::new("test");
        mfunc.blocks.push(mov_imm_block(
            0,
            0,
            Some(MJump { jump: Jump::Unconditional, unsigned: false, target: BlockId(3) }),
        ));
        mfunc.blocks.push(mov_imm_block(1, 40, None)); // past i8 range
        mfunc.blocks.push(mov_imm_block(
            2,
            0,
            Some(MJump { jump: Jump::Unconditional, unsigned: false, target: BlockId(3) }),
        ));
        mfunc.blocks.push(MBlock {
            id: Some(BlockId(3)),
            insts: vec![MInst::nullary(MOp::Ret)],
            jump: None,
        });

        let code = assemble_function(&mfunc).unwrap();
        // First jump widened, second stays narrow (jumping 0 bytes).
        assert_eq!(code.bytes[0], 0xE9);
        let end = code.bytes.len();
        assert_eq!(code.bytes[end - 3], 0xEB);
        assert_eq!(code.bytes[end - 2], 0x00);
        assert_eq!(code.bytes[end - 1], 0xC3);
    }

    #[test]
    fn test_unknown_target_is_patch_error() {
        let mut mfunc = MFunction::new("test");
        mfunc.blocks.push(mov_imm_block(
            0,
            0,
            Some(MJump { jump: Jump::Unconditional, unsigned: false, target: BlockId(9) }),
        ));
        assert!(assemble_function(&mfunc).is_err());
    }
}
