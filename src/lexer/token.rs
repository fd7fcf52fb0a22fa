#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Num,
    /// Type suffix directly following a numeric literal (`i64`, `f32`, `f64`).
    Suffix,
    Str,
    Sym,
    Eof,
}

/// A single surface-language token. For [`TokenKind::Str`] the text holds the
/// canonical escaped form of the decoded bytes, not the raw source slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte offset into the source.
    pub pos: usize,
    pub line: usize,
    pub col: usize,
}

impl Token {
    pub fn is_sym(&self, sym: &str) -> bool {
        self.kind == TokenKind::Sym && self.text == sym
    }

    pub fn is_ident(&self, ident: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == ident
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }
}
