//! x86-64 instruction model for the backend.
//!
//! Instructions are built up as values during code generation and serialized
//! through their [`Display`] implementations into GNU `as` Intel syntax
//! (`.intel_syntax noprefix`).
mod instructionsize;
mod reg;

use std::fmt::Display;

pub use self::instructionsize::InstructionSize;
pub use self::reg::*;

#[derive(Debug, Clone)]
pub enum InstructionOperand {
    Register(Reg),
    Immediate(i64),
    Memory(InstructionSize, String),
    Identifier(String),
}

impl Display for InstructionOperand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&match self {
            InstructionOperand::Register(reg) => reg.to_string(),
            InstructionOperand::Immediate(val) => format!("{val}"),
            InstructionOperand::Identifier(ident) => ident.to_string(),
            InstructionOperand::Memory(size, location) => format!("{size} PTR [{location}]"),
        })
    }
}

/// Condition codes for `setcc` emission. Signed codes serve integer
/// comparisons, unsigned codes the `ucomiss`/`ucomisd` flag layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    G,
    Le,
    Ge,
    B,
    A,
    Be,
    Ae,
}

impl Display for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::L => "l",
            Cond::G => "g",
            Cond::Le => "le",
            Cond::Ge => "ge",
            Cond::B => "b",
            Cond::A => "a",
            Cond::Be => "be",
            Cond::Ae => "ae",
        })
    }
}

#[derive(Debug, Clone)]
pub enum Instruction {
    Comment(String),
    Label(String),
    Lea(InstructionOperand, InstructionOperand),
    Mov(InstructionOperand, InstructionOperand),
    Movabs(InstructionOperand, InstructionOperand),
    Movzx(InstructionOperand, InstructionOperand),
    /// 32-bit bitwise transfer between a GPR and an XMM register.
    Movd(InstructionOperand, InstructionOperand),
    /// 64-bit bitwise transfer between a GPR and an XMM register.
    Movq(InstructionOperand, InstructionOperand),
    Add(InstructionOperand, InstructionOperand),
    Sub(InstructionOperand, InstructionOperand),
    Imul(InstructionOperand, InstructionOperand),
    Idiv(InstructionOperand),
    Cdq,
    Cqo,
    And(InstructionOperand, InstructionOperand),
    Or(InstructionOperand, InstructionOperand),
    Xor(InstructionOperand, InstructionOperand),
    Cmp(InstructionOperand, InstructionOperand),
    Test(InstructionOperand, InstructionOperand),
    Set(Cond, InstructionOperand),
    /// Scalar SSE operation with an explicit mnemonic (`addss`, `ucomisd`, …).
    Sse(&'static str, Reg, Reg),
    Je(String),
    Jne(String),
    Jmp(String),
    Push(Reg),
    Pop(Reg),
    Call(String),
    Ret,
    /// NOTE: Do never really use this, except for looooong literal assembly
    Literal(String),
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Instruction::Comment(comment) => format!("\t# {comment}"),
            Instruction::Label(label) => format!("\n{label}:"),
            Instruction::Lea(target, source) => format!("\tlea\t{target}, {source}"),
            Instruction::Mov(target, source) => format!("\tmov\t{target}, {source}"),
            Instruction::Movabs(target, source) => format!("\tmovabs\t{target}, {source}"),
            Instruction::Movzx(target, source) => format!("\tmovzx\t{target}, {source}"),
            Instruction::Movd(target, source) => format!("\tmovd\t{target}, {source}"),
            Instruction::Movq(target, source) => format!("\tmovq\t{target}, {source}"),
            Instruction::Add(target, source) => format!("\tadd\t{target}, {source}"),
            Instruction::Sub(target, source) => format!("\tsub\t{target}, {source}"),
            Instruction::Imul(target, source) => format!("\timul\t{target}, {source}"),
            Instruction::Idiv(source) => format!("\tidiv\t{source}"),
            Instruction::Cdq => "\tcdq".to_string(),
            Instruction::Cqo => "\tcqo".to_string(),
            Instruction::And(target, source) => format!("\tand\t{target}, {source}"),
            Instruction::Or(target, source) => format!("\tor\t{target}, {source}"),
            Instruction::Xor(target, source) => format!("\txor\t{target}, {source}"),
            Instruction::Cmp(target, source) => format!("\tcmp\t{target}, {source}"),
            Instruction::Test(target, source) => format!("\ttest\t{target}, {source}"),
            Instruction::Set(cond, target) => format!("\tset{cond}\t{target}"),
            Instruction::Sse(op, target, source) => format!("\t{op}\t{target}, {source}"),
            Instruction::Je(target) => format!("\tje\t{target}"),
            Instruction::Jne(target) => format!("\tjne\t{target}"),
            Instruction::Jmp(target) => format!("\tjmp\t{target}"),
            Instruction::Push(source) => format!("\tpush\t{source}"),
            Instruction::Pop(target) => format!("\tpop\t{target}"),
            Instruction::Call(name) => format!("\tcall\t{name}"),
            Instruction::Ret => "\tret".to_string(),
            Instruction::Literal(string) => string.to_owned(),
        };
        f.write_str(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_operand_display() {
        let op = InstructionOperand::Memory(InstructionSize::Dword, format!("{}-8", Reg::Rbp));
        assert_eq!(op.to_string(), "DWORD PTR [rbp-8]");
    }

    #[test]
    fn test_sized_register_projection() {
        assert_eq!(Reg::Rax.sized(InstructionSize::Dword), Reg::Eax);
        assert_eq!(Reg::Eax.sized(InstructionSize::Qword), Reg::Rax);
        assert_eq!(Reg::Rcx.sized(InstructionSize::Byte), Reg::Cl);
        assert_eq!(Reg::Rbp.sized(InstructionSize::Dword), Reg::Rbp);
    }

    #[test]
    fn test_instruction_display() {
        let mov = Instruction::Mov(
            InstructionOperand::Register(Reg::Eax),
            InstructionOperand::Immediate(7),
        );
        assert_eq!(mov.to_string(), "\tmov\teax, 7");

        let set = Instruction::Set(Cond::Le, InstructionOperand::Register(Reg::Al));
        assert_eq!(set.to_string(), "\tsetle\tal");
    }
}
