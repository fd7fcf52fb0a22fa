//! Diagnostic codes and the pipeline-wide error type.
//!
//! Parser and semantic failures carry a numeric code and are printed to
//! stderr as a space-separated `code pos tok line col` record in addition to
//! the human-readable message; the external diagnostic formatter consumes
//! those records.
use thiserror::Error;

use crate::{codegen::LowerError, ir::IrError, lexer::LexError, linker::LinkError};

/// Diagnostic code assignments. Parser codes are 601–619 and 700–701,
/// intrinsic codes 3301–3308, semantic codes 7201–7251; an undefined local
/// is reported as `UNDEFINED_LOCAL_BASE + id`.
pub mod codes {
    pub const EXPECTED_FN: u32 = 601;
    pub const EXPECTED_FN_NAME: u32 = 602;
    pub const EXPECTED_PARAM_LPAREN: u32 = 603;
    pub const BAD_PARAM: u32 = 604;
    pub const EXPECTED_PARAM_RPAREN: u32 = 605;
    pub const EXPECTED_ARROW: u32 = 606;
    pub const BAD_RETURN_TYPE: u32 = 607;
    pub const EXPECTED_BODY_LBRACE: u32 = 608;
    pub const EXPECTED_BODY_RBRACE: u32 = 610;
    pub const EXPECTED_TOP_LEVEL: u32 = 611;
    pub const EXPECTED_STRUCT: u32 = 612;
    pub const EXPECTED_STRUCT_NAME: u32 = 613;
    pub const EXPECTED_STRUCT_LBRACE: u32 = 614;
    pub const BAD_STRUCT_FIELD: u32 = 615;
    pub const EXPECTED_FIELD_COLON: u32 = 616;
    pub const BAD_FIELD_TYPE: u32 = 617;
    pub const EXPECTED_STRUCT_RBRACE: u32 = 618;
    pub const TOO_MANY_FIELDS: u32 = 619;
    pub const EXPECTED_EXPRESSION: u32 = 700;
    pub const EXPECTED_TERMINAL: u32 = 701;

    pub const UNKNOWN_INTRINSIC: u32 = 3301;
    pub const STR_INTRINSIC_ARITY: u32 = 3302;
    pub const FD_RW_ARITY: u32 = 3303;
    pub const PATH_OPEN_ARITY: u32 = 3306;
    pub const FD_CLOSE_ARITY: u32 = 3307;
    pub const INTRINSIC_ARITY: u32 = 3308;

    pub const UNDEFINED_FUNCTION: u32 = 7201;
    pub const CALL_ARITY: u32 = 7202;
    pub const TYPE_MISMATCH: u32 = 7203;
    pub const COND_TYPE: u32 = 7227;
    pub const LET_TYPE_MISMATCH: u32 = 7230;
    pub const RETURN_TYPE_MISMATCH: u32 = 7231;

    pub const UNDEFINED_LOCAL_BASE: u32 = 4000;

    /// Maximum number of fields per struct declaration.
    pub const MAX_STRUCT_FIELDS: usize = 16;
}

/// A coded frontend diagnostic, positioned at the token that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("error {code}: {msg} at {line}:{col}")]
pub struct Diagnostic {
    pub code: u32,
    /// Byte offset of the offending token.
    pub pos: usize,
    /// Index of the offending token in the token stream.
    pub tok: usize,
    pub line: usize,
    pub col: usize,
    pub msg: String,
}

impl Diagnostic {
    /// The machine-readable record the diagnostic formatter consumes.
    pub fn record(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.code, self.pos, self.tok, self.line, self.col
        )
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] Diagnostic),
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("{0}")]
    Usage(String),
    #[error("assembler failed: {0}")]
    Assembler(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_record_format() {
        let diag = Diagnostic {
            code: 701,
            pos: 42,
            tok: 7,
            line: 3,
            col: 5,
            msg: "expected terminal".to_owned(),
        };
        assert_eq!(diag.record(), "701 42 7 3 5");
    }
}
