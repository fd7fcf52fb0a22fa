use std::fmt::Display;

use super::InstructionSize;

/// Registers addressable by the backend. General purpose registers carry
/// their size in the variant; XMM registers are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax,
    Eax,
    Al,
    Rcx,
    Ecx,
    Cl,
    Rdx,
    Edx,
    Dl,
    Rsi,
    Esi,
    Rdi,
    Edi,
    Rbp,
    Rsp,
    R8,
    R8d,
    R9,
    R9d,
    R10,
    R10d,
    R11,
    R11d,
    Xmm(u8),
}

/// Integer argument registers of the System V AMD64 calling convention.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

impl Reg {
    /// Project this register onto the register of the same family with the
    /// given operand size.
    pub fn sized(self, size: InstructionSize) -> Reg {
        use InstructionSize::*;
        use Reg::*;

        match (self, size) {
            (Rax | Eax | Al, Qword) => Rax,
            (Rax | Eax | Al, Dword) => Eax,
            (Rax | Eax | Al, Byte) => Al,
            (Rcx | Ecx | Cl, Qword) => Rcx,
            (Rcx | Ecx | Cl, Dword) => Ecx,
            (Rcx | Ecx | Cl, Byte) => Cl,
            (Rdx | Edx | Dl, Qword) => Rdx,
            (Rdx | Edx | Dl, Dword) => Edx,
            (Rdx | Edx | Dl, Byte) => Dl,
            (Rsi | Esi, Dword) => Esi,
            (Rsi | Esi, _) => Rsi,
            (Rdi | Edi, Dword) => Edi,
            (Rdi | Edi, _) => Rdi,
            (R8 | R8d, Dword) => R8d,
            (R8 | R8d, _) => R8,
            (R9 | R9d, Dword) => R9d,
            (R9 | R9d, _) => R9,
            (R10 | R10d, Dword) => R10d,
            (R10 | R10d, _) => R10,
            (R11 | R11d, Dword) => R11d,
            (R11 | R11d, _) => R11,
            (reg, _) => reg,
        }
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Reg::Rax => "rax".to_owned(),
            Reg::Eax => "eax".to_owned(),
            Reg::Al => "al".to_owned(),
            Reg::Rcx => "rcx".to_owned(),
            Reg::Ecx => "ecx".to_owned(),
            Reg::Cl => "cl".to_owned(),
            Reg::Rdx => "rdx".to_owned(),
            Reg::Edx => "edx".to_owned(),
            Reg::Dl => "dl".to_owned(),
            Reg::Rsi => "rsi".to_owned(),
            Reg::Esi => "esi".to_owned(),
            Reg::Rdi => "rdi".to_owned(),
            Reg::Edi => "edi".to_owned(),
            Reg::Rbp => "rbp".to_owned(),
            Reg::Rsp => "rsp".to_owned(),
            Reg::R8 => "r8".to_owned(),
            Reg::R8d => "r8d".to_owned(),
            Reg::R9 => "r9".to_owned(),
            Reg::R9d => "r9d".to_owned(),
            Reg::R10 => "r10".to_owned(),
            Reg::R10d => "r10d".to_owned(),
            Reg::R11 => "r11".to_owned(),
            Reg::R11d => "r11d".to_owned(),
            Reg::Xmm(n) => format!("xmm{n}"),
        };
        f.write_str(&value)
    }
}
