//! Compiler pipeline for the Coatl programming language subset.
//!
//! Three stages turn a `.coatl` source file into a freestanding x86-64
//! Linux executable: the frontend ([`lexer`] + [`parser`]) emits the
//! `coatl_ir v1` s-expression text, the backend ([`ir`] reader +
//! [`codegen`]) lowers it to Intel-syntax assembly including the runtime
//! prelude, and the [`linker`] packages the assembled object into a
//! statically-linked executable with entry `coatl_start`.
mod asm;

pub mod codegen;
pub mod error;
pub mod ir;
pub mod lexer;
pub mod linker;
pub mod parser;

use error::CompileError;

/// Run the frontend: source text to `coatl_ir v1` text.
pub fn source_to_ir(source: &str) -> Result<String, CompileError> {
    let tokens = lexer::Lexer::new(source).lex()?;
    Ok(parser::Parser::new(tokens).parse_program()?)
}

/// Run the backend: IR text to assembly text.
pub fn ir_to_asm(ir_text: &str) -> Result<String, CompileError> {
    let root = ir::parse(ir_text)?;
    Ok(codegen::lower(&root)?)
}
