//! S-expression reader for the `coatl_ir v1` wire format.
//!
//! The reader recognizes three token shapes: parentheses, double-quoted
//! (escape-tolerant) strings, and bare atoms. String atoms keep their
//! surrounding quotes so the backend can re-decode the payload.
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("unterminated string in IR at token {0}")]
    UnterminatedString(usize),
    #[error("unexpected end of IR input")]
    UnexpectedEof,
    #[error("unexpected ')' at token {0}")]
    UnexpectedClose(usize),
    #[error("missing ')' at token {0}")]
    MissingClose(usize),
    #[error("extra tokens after root node at token {0}")]
    TrailingTokens(usize),
    #[error("invalid string token: {0}")]
    InvalidString(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Atom(String),
    List(Vec<Node>),
}

impl Node {
    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(items) => Some(items),
            Node::Atom(_) => None,
        }
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Node::Atom(text) => Some(text),
            Node::List(_) => None,
        }
    }

    /// The leading atom of a list node, i.e. its tag.
    pub fn tag(&self) -> Option<&str> {
        self.as_list()?.first()?.as_atom()
    }
}

pub fn tokenize(src: &str) -> Result<Vec<String>, IrError> {
    let bytes = src.as_bytes();
    let mut toks = vec![];
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == b'(' || c == b')' {
            toks.push((c as char).to_string());
            i += 1;
            continue;
        }
        if c == b'"' {
            let mut j = i + 1;
            let mut esc = false;
            while j < bytes.len() {
                let ch = bytes[j];
                if esc {
                    esc = false;
                } else if ch == b'\\' {
                    esc = true;
                } else if ch == b'"' {
                    break;
                }
                j += 1;
            }
            if j >= bytes.len() {
                return Err(IrError::UnterminatedString(toks.len()));
            }
            toks.push(src[i..=j].to_owned());
            i = j + 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'(' && bytes[i] != b')' {
            i += 1;
        }
        toks.push(src[start..i].to_owned());
    }

    Ok(toks)
}

pub fn parse_tokens(tokens: &[String]) -> Result<Node, IrError> {
    let mut idx = 0;
    let root = parse_one(tokens, &mut idx)?;
    if idx != tokens.len() {
        return Err(IrError::TrailingTokens(idx));
    }
    Ok(root)
}

fn parse_one(tokens: &[String], idx: &mut usize) -> Result<Node, IrError> {
    let Some(tok) = tokens.get(*idx) else {
        return Err(IrError::UnexpectedEof);
    };
    *idx += 1;

    match tok.as_str() {
        "(" => {
            let mut items = vec![];
            while tokens.get(*idx).is_some_and(|t| t != ")") {
                items.push(parse_one(tokens, idx)?);
            }
            if tokens.get(*idx).is_none() {
                return Err(IrError::MissingClose(*idx));
            }
            *idx += 1;
            Ok(Node::List(items))
        }
        ")" => Err(IrError::UnexpectedClose(*idx - 1)),
        _ => Ok(Node::Atom(tok.clone())),
    }
}

/// Parse a complete IR document into its root node.
pub fn parse(src: &str) -> Result<Node, IrError> {
    parse_tokens(&tokenize(src)?)
}

/// Decode a quoted string atom into the byte sequence it denotes.
pub fn decode_string_atom(tok: &str) -> Result<Vec<u8>, IrError> {
    let inner = tok
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| IrError::InvalidString(tok.to_owned()))?;

    let bytes = inner.as_bytes();
    let mut out = vec![];
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let Some(&esc) = bytes.get(i + 1) else {
            return Err(IrError::InvalidString(tok.to_owned()));
        };
        match esc {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'"' => out.push(b'"'),
            b'\\' => out.push(b'\\'),
            b'x' => {
                let hex = bytes
                    .get(i + 2..i + 4)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                let Some(byte) = hex else {
                    return Err(IrError::InvalidString(tok.to_owned()));
                };
                out.push(byte);
                i += 2;
            }
            _ => return Err(IrError::InvalidString(tok.to_owned())),
        }
        i += 2;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_nested_lists() {
        let root = parse("(a (b c) d)").unwrap();
        assert_eq!(
            root,
            Node::List(vec![
                Node::Atom("a".into()),
                Node::List(vec![Node::Atom("b".into()), Node::Atom("c".into())]),
                Node::Atom("d".into()),
            ])
        );
    }

    #[test]
    fn test_parse_string_atom_kept_quoted() {
        let root = parse("(string \"a b\\\"c\")").unwrap();
        let items = root.as_list().unwrap();
        assert_eq!(items[1].as_atom().unwrap(), "\"a b\\\"c\"");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("(a"), Err(IrError::MissingClose(2)));
        assert_eq!(parse(")"), Err(IrError::UnexpectedClose(0)));
        assert_eq!(parse("a b"), Err(IrError::TrailingTokens(1)));
        assert!(matches!(parse("(\"x)"), Err(IrError::UnterminatedString(_))));
    }

    #[test]
    fn test_decode_string_atom() {
        assert_eq!(decode_string_atom("\"hi\"").unwrap(), b"hi");
        assert_eq!(decode_string_atom("\"a\\x0ab\"").unwrap(), b"a\nb");
        assert_eq!(decode_string_atom("\"\\\\\\\"\"").unwrap(), b"\\\"");
        assert!(decode_string_atom("nope").is_err());
        assert!(decode_string_atom("\"\\q\"").is_err());
    }

    #[test]
    fn test_tag() {
        let root = parse("(fn main)").unwrap();
        assert_eq!(root.tag(), Some("fn"));
    }
}
