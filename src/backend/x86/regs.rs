//! x86-64 registers and the target calling conventions.
//!
//! The register allocators work on a flat register file of 32 entries:
//! indices 0–15 are the general-purpose registers in encoding order and
//! 16–31 are XMM0–XMM15. The file's volatility flags select the System-V
//! or Windows convention at runtime.

use crate::regalloc::{RegClass, RegisterFile};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Encoding value for ModR/M and the REX prefix.
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// Whether this register requires a REX extension bit.
    pub fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }

    /// The lower 3 bits for ModR/M encoding.
    pub fn modrm_bits(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn from_encoding(encoding: u8) -> Reg {
        const REGS: [Reg; 16] = [
            Reg::Rax,
            Reg::Rcx,
            Reg::Rdx,
            Reg::Rbx,
            Reg::Rsp,
            Reg::Rbp,
            Reg::Rsi,
            Reg::Rdi,
            Reg::R8,
            Reg::R9,
            Reg::R10,
            Reg::R11,
            Reg::R12,
            Reg::R13,
            Reg::R14,
            Reg::R15,
        ];
        REGS[encoding as usize & 0xf]
    }
}

/// Register-file index of a general-purpose register.
pub fn gpr_file_index(reg: Reg) -> usize {
    reg.encoding() as usize
}

/// Register-file index of an XMM register.
pub fn xmm_file_index(xmm: u8) -> usize {
    16 + xmm as usize
}

pub const FILE_SIZE: usize = 32;

/// Where a register-file index lands: a GPR or an XMM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileReg {
    Gpr(Reg),
    Xmm(u8),
}

pub fn file_reg(index: usize) -> FileReg {
    if index < 16 {
        FileReg::Gpr(Reg::from_encoding(index as u8))
    } else {
        FileReg::Xmm((index - 16) as u8)
    }
}

/// Target operating system, selecting the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub os: TargetOs,
}

impl Target {
    pub fn new(os: TargetOs) -> Self {
        Self { os }
    }

    /// Integer argument registers in position order.
    pub fn int_arg_regs(&self) -> &'static [Reg] {
        match self.os {
            TargetOs::Linux => &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
            TargetOs::Windows => &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
        }
    }

    /// Number of XMM registers carrying floating-point arguments.
    pub fn max_sse_args(&self) -> usize {
        match self.os {
            TargetOs::Linux => 8,
            TargetOs::Windows => 4,
        }
    }

    /// Bytes the caller reserves below its outgoing stack arguments.
    pub fn shadow_space(&self) -> i32 {
        match self.os {
            TargetOs::Linux => 0,
            TargetOs::Windows => 32,
        }
    }

    /// The register file handed to the allocators. Only the non-volatile
    /// registers of each class are assignable; RSP is always reserved.
    pub fn register_file(&self) -> RegisterFile {
        let mut file = RegisterFile::new(FILE_SIZE);
        for i in 16..FILE_SIZE {
            file.set_class(i, RegClass::Sse);
        }
        let preserved_gprs: &[Reg] = match self.os {
            TargetOs::Linux => &[Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15],
            TargetOs::Windows => &[
                Reg::Rbx,
                Reg::Rbp,
                Reg::Rsi,
                Reg::Rdi,
                Reg::R12,
                Reg::R13,
                Reg::R14,
                Reg::R15,
            ],
        };
        for &reg in preserved_gprs {
            file.set_volatile(gpr_file_index(reg), false);
        }
        // System-V leaves every XMM register volatile; XMM8–XMM15 are
        // treated as preserved by our own prologue so floating-point
        // values survive intra-module calls.
        let preserved_xmms: std::ops::Range<u8> = match self.os {
            TargetOs::Linux => 8..16,
            TargetOs::Windows => 6..16,
        };
        for xmm in preserved_xmms {
            file.set_volatile(xmm_file_index(xmm), false);
        }
        file
    }

    /// Name of the executable the driver writes by default.
    pub fn default_output(&self) -> &'static str {
        match self.os {
            TargetOs::Linux => "app",
            TargetOs::Windows => "app.exe",
        }
    }

    /// The library unresolved extern symbols are imported from.
    pub fn default_import_library(&self) -> &'static str {
        match self.os {
            TargetOs::Linux => "libc.so.6",
            TargetOs::Windows => "msvcrt.dll",
        }
    }
}
