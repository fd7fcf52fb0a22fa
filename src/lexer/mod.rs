//! Tokenizer for the Coatl surface language.
//!
//! A single pass over the source bytes produces the token stream consumed by
//! the parser. String literals are escape-decoded here; the decoded bytes are
//! stored in the canonical escaped form so that distinct byte sequences have
//! distinct token texts.
mod token;

pub use token::*;

use std::fmt::Write;

use thiserror::Error;

const TWO_CHAR_SYMS: [&str; 7] = ["->", "==", "!=", "<=", ">=", "&&", "||"];
const ONE_CHAR_SYMS: &[u8] = b"(){}[]:,;=+-*/<>!.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{msg} at {line}:{col}")]
pub struct LexError {
    pub msg: String,
    pub pos: usize,
    pub line: usize,
    pub col: usize,
}

pub type LexResult<T> = Result<T, LexError>;

#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    src: &'a [u8],
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            src: input.as_bytes(),
            tokens: vec![],
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.src.get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(byte)
    }

    fn error(&self, msg: impl Into<String>) -> LexError {
        LexError {
            msg: msg.into(),
            pos: self.pos,
            line: self.line,
            col: self.col,
        }
    }

    fn push(&mut self, kind: TokenKind, text: String, pos: usize, line: usize, col: usize) {
        self.tokens.push(Token {
            kind,
            text,
            pos,
            line,
            col,
        });
    }

    pub fn lex(mut self) -> LexResult<Vec<Token>> {
        loop {
            self.eat_whitespace_and_comments();

            let (pos, line, col) = (self.pos, self.line, self.col);
            let Some(next) = self.peek() else {
                self.push(TokenKind::Eof, String::new(), pos, line, col);
                return Ok(self.tokens);
            };

            match next {
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_ident(),
                b'0'..=b'9' => self.lex_number()?,
                b'"' => self.lex_string()?,
                _ => self.lex_symbol()?,
            }
        }
    }

    fn eat_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(byte) if byte.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_ident(&mut self) {
        let (pos, line, col) = (self.pos, self.line, self.col);
        let mut text = String::new();

        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphanumeric() || byte == b'_' {
                text.push(byte as char);
                self.bump();
            } else {
                break;
            }
        }

        self.push(TokenKind::Ident, text, pos, line, col);
    }

    fn lex_number(&mut self) -> LexResult<()> {
        let (pos, line, col) = (self.pos, self.line, self.col);
        let mut text = String::new();
        let mut seen_dot = false;

        while let Some(byte) = self.peek() {
            if byte.is_ascii_digit() {
                text.push(byte as char);
                self.bump();
            } else if byte == b'.' && !seen_dot && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
                seen_dot = true;
                text.push('.');
                self.bump();
            } else {
                break;
            }
        }

        self.push(TokenKind::Num, text, pos, line, col);
        self.lex_suffix();
        Ok(())
    }

    /// A type suffix glued to a numeric literal becomes its own token.
    fn lex_suffix(&mut self) {
        let (pos, line, col) = (self.pos, self.line, self.col);

        for suffix in ["i64", "f32", "f64"] {
            let bytes = suffix.as_bytes();
            if self.src[self.pos..].starts_with(bytes) {
                let boundary = self
                    .peek_at(bytes.len())
                    .is_none_or(|b| !b.is_ascii_alphanumeric() && b != b'_');
                if boundary {
                    for _ in 0..bytes.len() {
                        self.bump();
                    }
                    self.push(TokenKind::Suffix, suffix.to_owned(), pos, line, col);
                    return;
                }
            }
        }
    }

    fn lex_string(&mut self) -> LexResult<()> {
        let (pos, line, col) = (self.pos, self.line, self.col);
        self.bump();

        let mut bytes = vec![];
        loop {
            let Some(byte) = self.bump() else {
                return Err(LexError {
                    msg: "unterminated string literal".to_owned(),
                    pos,
                    line,
                    col,
                });
            };

            match byte {
                b'"' => break,
                b'\\' => {
                    let Some(esc) = self.bump() else {
                        return Err(LexError {
                            msg: "unterminated string literal".to_owned(),
                            pos,
                            line,
                            col,
                        });
                    };
                    match esc {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'"' => bytes.push(b'"'),
                        b'\\' => bytes.push(b'\\'),
                        b'x' => {
                            let hi = self.bump().and_then(hex_digit);
                            let lo = self.bump().and_then(hex_digit);
                            match (hi, lo) {
                                (Some(hi), Some(lo)) => bytes.push(hi << 4 | lo),
                                _ => return Err(self.error("invalid \\x escape")),
                            }
                        }
                        other => {
                            return Err(self.error(format!("unknown escape '\\{}'", other as char)))
                        }
                    }
                }
                other => bytes.push(other),
            }
        }

        self.push(TokenKind::Str, escape_bytes(&bytes), pos, line, col);
        Ok(())
    }

    fn lex_symbol(&mut self) -> LexResult<()> {
        let (pos, line, col) = (self.pos, self.line, self.col);

        if let (Some(a), Some(b)) = (self.peek(), self.peek_at(1)) {
            let two = [a, b];
            if let Ok(two) = std::str::from_utf8(&two) {
                if TWO_CHAR_SYMS.contains(&two) {
                    self.bump();
                    self.bump();
                    self.push(TokenKind::Sym, two.to_owned(), pos, line, col);
                    return Ok(());
                }
            }
        }

        let byte = self.peek().unwrap();
        if ONE_CHAR_SYMS.contains(&byte) {
            self.bump();
            self.push(TokenKind::Sym, (byte as char).to_string(), pos, line, col);
            return Ok(());
        }

        Err(self.error(format!("unrecognized byte 0x{byte:02x}")))
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

/// Canonical escaped form of a decoded byte sequence: printable ASCII except
/// quote and backslash stays verbatim, everything else becomes `\xHH`.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if (32..=126).contains(&byte) && byte != b'"' && byte != b'\\' {
            out.push(byte as char);
        } else {
            write!(out, "\\x{byte:02x}").unwrap();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn texts(tokens: &[Token]) -> Vec<(TokenKind, &str)> {
        tokens.iter().map(|t| (t.kind, t.text.as_str())).collect()
    }

    #[test]
    fn test_lex_function_header() {
        let tokens = Lexer::new("fn add(a: i32) -> i32 {}").lex().unwrap();

        assert_eq!(
            texts(&tokens),
            vec![
                (TokenKind::Ident, "fn"),
                (TokenKind::Ident, "add"),
                (TokenKind::Sym, "("),
                (TokenKind::Ident, "a"),
                (TokenKind::Sym, ":"),
                (TokenKind::Ident, "i32"),
                (TokenKind::Sym, ")"),
                (TokenKind::Sym, "->"),
                (TokenKind::Ident, "i32"),
                (TokenKind::Sym, "{"),
                (TokenKind::Sym, "}"),
                (TokenKind::Eof, ""),
            ]
        );
    }

    #[test]
    fn test_lex_suffix_is_separate_token() {
        let tokens = Lexer::new("3i64 2.5f64 7").lex().unwrap();

        assert_eq!(
            texts(&tokens),
            vec![
                (TokenKind::Num, "3"),
                (TokenKind::Suffix, "i64"),
                (TokenKind::Num, "2.5"),
                (TokenKind::Suffix, "f64"),
                (TokenKind::Num, "7"),
                (TokenKind::Eof, ""),
            ]
        );
    }

    #[test]
    fn test_lex_suffix_needs_boundary() {
        // `i64x` is a plain identifier, not a suffix.
        let tokens = Lexer::new("3 i64x").lex().unwrap();
        assert_eq!(
            texts(&tokens),
            vec![
                (TokenKind::Num, "3"),
                (TokenKind::Ident, "i64x"),
                (TokenKind::Eof, ""),
            ]
        );
    }

    #[test]
    fn test_lex_string_escapes() {
        let tokens = Lexer::new(r#""hi\n\x41\"\\""#).lex().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "hi\\x0aA\\x22\\x5c");
    }

    #[test]
    fn test_lex_unterminated_string() {
        let err = Lexer::new("\"oops").lex().unwrap_err();
        assert_eq!(err.msg, "unterminated string literal");
        assert_eq!((err.line, err.col), (1, 1));
    }

    #[test]
    fn test_lex_two_char_symbols_first() {
        let tokens = Lexer::new("a<=b->c==d").lex().unwrap();
        let syms: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Sym)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(syms, vec!["<=", "->", "=="]);
    }

    #[test]
    fn test_lex_comments_skipped() {
        let tokens = Lexer::new("1 // comment\n2").lex().unwrap();
        assert_eq!(
            texts(&tokens),
            vec![
                (TokenKind::Num, "1"),
                (TokenKind::Num, "2"),
                (TokenKind::Eof, ""),
            ]
        );
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn test_lex_unknown_byte() {
        let err = Lexer::new("let @").lex().unwrap_err();
        assert!(err.msg.contains("0x40"));
    }
}
