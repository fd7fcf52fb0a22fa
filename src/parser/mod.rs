//! Recursive-descent frontend for the Coatl subset.
//!
//! The parser consumes the token stream produced by [`crate::lexer`] and
//! emits `coatl_ir v1` text directly. Every subexpression parse returns the
//! emitted IR fragment together with its resolved type, which drives the
//! operand promotion rules. Struct values are scalarized here: a struct
//! binding becomes one `i32` local per field (`x__field`), and a
//! struct-returning function is re-parsed once per field into an `i32`
//! companion (`f__ret__field`), so the IR only ever sees scalars.
mod types;

pub use types::*;

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{
    error::{codes, Diagnostic},
    lexer::{Token, TokenKind},
};

/// Argument counts of the runtime intrinsics callable from user code.
static INTRINSICS: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    HashMap::from([
        ("__mem_load", 1),
        ("__mem_load8", 1),
        ("__mem_store", 2),
        ("__mem_store8", 2),
        ("__fd_write", 4),
        ("__fd_read", 4),
        ("__fd_close", 1),
        ("__path_open", 9),
        ("__tty_get_mode", 1),
        ("__tty_set_raw", 3),
        ("__tty_restore", 1),
    ])
});

const CMP_OPS: [&str; 6] = ["<", ">", "<=", ">=", "==", "!="];

fn op_name(sym: &str) -> &'static str {
    match sym {
        "<" => "lt",
        ">" => "gt",
        "<=" => "le",
        ">=" => "ge",
        "==" => "eq",
        "!=" => "ne",
        "+" => "add",
        "-" => "sub",
        "*" => "mul",
        "/" => "div",
        "&&" => "and",
        "||" => "or",
        _ => unreachable!("unmapped operator symbol"),
    }
}

fn intrinsic_arity_code(name: &str) -> u32 {
    match name {
        "__fd_read" | "__fd_write" => codes::FD_RW_ARITY,
        "__path_open" => codes::PATH_OPEN_ARITY,
        "__fd_close" => codes::FD_CLOSE_ARITY,
        _ => codes::INTRINSIC_ARITY,
    }
}

type PResult<T> = Result<T, Diagnostic>;

/// The typed-expression contract: every subexpression parse yields the IR
/// fragment it emitted and the type it resolved to.
#[derive(Debug, Clone)]
struct Expr {
    ir: String,
    ty: Type,
}

#[derive(Debug, Clone)]
enum RetKind {
    Scalar(Type),
    Struct(String),
}

#[derive(Debug, Clone)]
struct FnInfo {
    arity: usize,
    ret: RetKind,
}

#[derive(Debug, Clone)]
struct StructDef {
    name: String,
    fields: Vec<String>,
}

/// Per-function parser state. Cloned at the body start of struct-returning
/// functions so each return-field pass starts from the same bindings.
#[derive(Debug, Clone, Default)]
struct FnState {
    var_types: HashMap<String, Type>,
    local_structs: HashMap<String, String>,
    param_structs: HashMap<String, String>,
    array_elems: HashMap<String, Type>,
    ident_ids: HashMap<String, usize>,
    ret: Option<RetKind>,
    /// Return-field context: while set, `return S { … }` lowers to the
    /// initializer of this field.
    ret_field: Option<String>,
}

pub struct Parser {
    tokens: Vec<Token>,
    idx: usize,
    structs: Vec<StructDef>,
    fns: HashMap<String, FnInfo>,
    state: FnState,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.is_empty() {
            tokens.push(Token {
                kind: TokenKind::Eof,
                text: String::new(),
                pos: 0,
                line: 1,
                col: 1,
            });
        }
        Self {
            tokens,
            idx: 0,
            structs: vec![],
            fns: HashMap::default(),
            state: FnState::default(),
        }
    }

    pub fn parse_program(mut self) -> PResult<String> {
        let mut fns_ir = String::new();
        let mut saw_main = false;

        while !self.peek().is_eof() {
            if self.peek().is_ident("struct") {
                self.parse_struct_decl()?;
            } else if self.peek().is_ident("fn") {
                let (name, fn_ir) = self.parse_fn()?;
                if name == "main" {
                    saw_main = true;
                }
                fns_ir += &fn_ir;
            } else {
                return Err(self.diag(
                    codes::EXPECTED_TOP_LEVEL,
                    "expected top-level declaration ('fn' or 'struct')",
                ));
            }
        }

        if !saw_main {
            return Err(self.diag(codes::UNDEFINED_FUNCTION, "expected a 'main' function"));
        }

        Ok(format!(
            "(coatl_ir v1\n  (structs)\n  (functions\n{fns_ir}  )\n)\n"
        ))
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.idx.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, n: usize) -> &Token {
        &self.tokens[(self.idx + n).min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.idx < self.tokens.len() {
            self.idx += 1;
        }
        tok
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if self.peek().is_sym(sym) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str, code: u32) -> PResult<Token> {
        if self.peek().is_sym(sym) {
            Ok(self.next())
        } else {
            Err(self.diag(code, format!("expected '{}', got '{}'", sym, self.peek().text)))
        }
    }

    fn expect_ident(&mut self, code: u32) -> PResult<Token> {
        if self.peek().kind == TokenKind::Ident {
            Ok(self.next())
        } else {
            Err(self.diag(code, format!("expected identifier, got '{}'", self.peek().text)))
        }
    }

    fn expect_num(&mut self, code: u32) -> PResult<Token> {
        if self.peek().kind == TokenKind::Num {
            Ok(self.next())
        } else {
            Err(self.diag(code, format!("expected number, got '{}'", self.peek().text)))
        }
    }

    fn diag(&self, code: u32, msg: impl Into<String>) -> Diagnostic {
        let tok = self.peek();
        Diagnostic {
            code,
            pos: tok.pos,
            tok: self.idx.min(self.tokens.len() - 1),
            line: tok.line,
            col: tok.col,
            msg: msg.into(),
        }
    }

    fn declare(&mut self, name: &str, ty: Type) {
        self.state.var_types.insert(name.to_owned(), ty);
        let next_id = self.state.ident_ids.len();
        self.state.ident_ids.entry(name.to_owned()).or_insert(next_id);
    }

    fn undefined_local(&self, name: &str) -> Diagnostic {
        let id = self.state.ident_ids.len() as u32;
        self.diag(
            codes::UNDEFINED_LOCAL_BASE + id,
            format!("undefined local '{name}'"),
        )
    }

    fn struct_fields(&self, name: &str) -> Option<&[String]> {
        self.structs
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.fields.as_slice())
    }

    /// Struct type of a struct-valued binding (local or parameter), if any.
    fn struct_var(&self, name: &str) -> Option<String> {
        self.state
            .local_structs
            .get(name)
            .or_else(|| self.state.param_structs.get(name))
            .cloned()
    }

    fn parse_struct_decl(&mut self) -> PResult<()> {
        if !self.peek().is_ident("struct") {
            return Err(self.diag(codes::EXPECTED_STRUCT, "expected 'struct'"));
        }
        self.next();
        let name = self.expect_ident(codes::EXPECTED_STRUCT_NAME)?.text;
        self.expect_sym("{", codes::EXPECTED_STRUCT_LBRACE)?;

        let mut fields = vec![];
        while !self.peek().is_sym("}") {
            if self.peek().is_eof() {
                return Err(self.diag(codes::EXPECTED_STRUCT_RBRACE, "expected '}'"));
            }
            let fld = self.expect_ident(codes::BAD_STRUCT_FIELD)?.text;
            self.expect_sym(":", codes::EXPECTED_FIELD_COLON)?;
            let ty = self.expect_ident(codes::BAD_FIELD_TYPE)?;
            if ty.text != "i32" {
                return Err(self.diag(
                    codes::BAD_FIELD_TYPE,
                    format!("unsupported struct field type '{}' (only i32)", ty.text),
                ));
            }
            fields.push(fld);
            if fields.len() > codes::MAX_STRUCT_FIELDS {
                return Err(self.diag(codes::TOO_MANY_FIELDS, "too many fields in struct"));
            }
            self.eat_sym(",");
        }
        self.next();

        self.structs.push(StructDef { name, fields });
        Ok(())
    }

    fn parse_fn(&mut self) -> PResult<(String, String)> {
        if !self.peek().is_ident("fn") {
            return Err(self.diag(codes::EXPECTED_FN, "expected 'fn'"));
        }
        self.next();
        let name = self.expect_ident(codes::EXPECTED_FN_NAME)?.text;
        self.expect_sym("(", codes::EXPECTED_PARAM_LPAREN)?;

        self.state = FnState::default();
        let (arity, params_ir) = self.parse_params()?;
        self.expect_sym(")", codes::EXPECTED_PARAM_RPAREN)?;
        self.expect_sym("->", codes::EXPECTED_ARROW)?;

        let ret_tok = self.expect_ident(codes::BAD_RETURN_TYPE)?;
        let ret = if let Ok(ty) = ret_tok.text.parse::<Type>() {
            RetKind::Scalar(ty)
        } else if self.struct_fields(&ret_tok.text).is_some() {
            RetKind::Struct(ret_tok.text.clone())
        } else {
            return Err(self.diag(
                codes::BAD_RETURN_TYPE,
                format!("unsupported return type '{}'", ret_tok.text),
            ));
        };

        self.fns.insert(
            name.clone(),
            FnInfo {
                arity,
                ret: ret.clone(),
            },
        );
        self.state.ret = Some(ret.clone());
        self.expect_sym("{", codes::EXPECTED_BODY_LBRACE)?;

        match ret {
            RetKind::Scalar(ty) => {
                let block = self.parse_block()?;
                Ok((
                    name.clone(),
                    format!("    (fn {name}\n{params_ir}      (ret {ty})\n{block}    )\n"),
                ))
            }
            RetKind::Struct(sname) => {
                // Parse the body once per field; each pass lowers
                // `return S { … }` to the initializer of its field.
                let fields = self.struct_fields(&sname).unwrap().to_vec();
                let body_start = self.idx;
                let entry_state = self.state.clone();
                let mut out = String::new();
                for fld in &fields {
                    self.idx = body_start;
                    self.state = entry_state.clone();
                    self.state.ret_field = Some(fld.clone());
                    let block = self.parse_block()?;
                    out += &format!(
                        "    (fn {name}__ret__{fld}\n{params_ir}      (ret i32)\n{block}    )\n"
                    );
                }
                self.state.ret_field = None;
                Ok((name, out))
            }
        }
    }

    fn parse_params(&mut self) -> PResult<(usize, String)> {
        if self.peek().is_sym(")") {
            return Ok((0, "      (params)\n".to_owned()));
        }

        let mut count = 0;
        let mut body = String::new();
        loop {
            let name = self.expect_ident(codes::BAD_PARAM)?.text;
            self.expect_sym(":", codes::BAD_PARAM)?;
            match self.parse_type_annotation(codes::BAD_PARAM)? {
                TypeAnnotation::Scalar(ty) => {
                    self.declare(&name, ty);
                    body += &format!("        (param {name} {ty})\n");
                    count += 1;
                }
                TypeAnnotation::Struct(sname) => {
                    let fields = self.struct_fields(&sname).unwrap().to_vec();
                    self.state.param_structs.insert(name.clone(), sname);
                    for fld in &fields {
                        let flat = format!("{name}__{fld}");
                        self.declare(&flat, Type::I32);
                        body += &format!("        (param {flat} i32)\n");
                        count += 1;
                    }
                }
                TypeAnnotation::Array(..) => {
                    return Err(self.diag(codes::BAD_PARAM, "array parameters are not supported"));
                }
            }
            if !self.eat_sym(",") {
                break;
            }
        }

        Ok((count, format!("      (params\n{body}      )\n")))
    }

    fn parse_type_annotation(&mut self, code: u32) -> PResult<TypeAnnotation> {
        if self.peek().is_sym("[") {
            self.next();
            let elem_tok = self.expect_ident(code)?;
            let Ok(elem) = elem_tok.text.parse::<Type>() else {
                return Err(self.diag(code, format!("unknown element type '{}'", elem_tok.text)));
            };
            self.expect_sym(";", code)?;
            let len_tok = self.expect_num(code)?;
            let len: usize = len_tok
                .text
                .parse()
                .map_err(|_| self.diag(code, "invalid array length"))?;
            if len == 0 {
                return Err(self.diag(code, "array length must be positive"));
            }
            self.expect_sym("]", code)?;
            return Ok(TypeAnnotation::Array(elem, len));
        }

        let tok = self.expect_ident(code)?;
        if let Ok(ty) = tok.text.parse::<Type>() {
            Ok(TypeAnnotation::Scalar(ty))
        } else if self.struct_fields(&tok.text).is_some() {
            Ok(TypeAnnotation::Struct(tok.text))
        } else {
            Err(self.diag(code, format!("unknown type '{}'", tok.text)))
        }
    }

    /// Parses statements up to and including the closing `}`.
    fn parse_block(&mut self) -> PResult<String> {
        let mut stmts = String::new();
        while !self.peek().is_sym("}") {
            if self.peek().is_eof() {
                return Err(self.diag(codes::EXPECTED_BODY_RBRACE, "expected '}'"));
            }
            stmts += &self.parse_stmt()?;
        }
        self.next();

        if stmts.is_empty() {
            Ok("      (block)\n".to_owned())
        } else {
            Ok(format!("      (block\n{stmts}      )\n"))
        }
    }

    fn parse_stmt(&mut self) -> PResult<String> {
        let t = self.peek().clone();
        if t.is_ident("let") {
            return self.parse_let();
        }
        if t.is_ident("return") {
            return self.parse_return();
        }
        if t.is_ident("if") {
            return self.parse_if();
        }
        if t.is_ident("while") {
            return self.parse_while();
        }
        if t.kind == TokenKind::Ident {
            if self.peek_at(1).is_sym(".") && self.peek_at(3).is_sym("=") {
                return self.parse_field_assign();
            }
            if self.peek_at(1).is_sym("=") {
                return self.parse_assign();
            }
            if self.peek_at(1).is_sym("[") && self.index_assign_ahead() {
                return self.parse_index_assign();
            }
        }

        let expr = self.parse_expr()?;
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;
        Ok(format!("        (expr\n{}        )\n", expr.ir))
    }

    /// Whether `name [ … ]` at the cursor is an element assignment, i.e. the
    /// matching `]` is followed by `=`.
    fn index_assign_ahead(&self) -> bool {
        let mut depth = 1;
        let mut i = self.idx + 2;
        while let Some(tok) = self.tokens.get(i) {
            if tok.is_eof() {
                return false;
            }
            if tok.is_sym("[") {
                depth += 1;
            } else if tok.is_sym("]") {
                depth -= 1;
                if depth == 0 {
                    return self.tokens.get(i + 1).is_some_and(|t| t.is_sym("="));
                }
            }
            i += 1;
        }
        false
    }

    fn parse_let(&mut self) -> PResult<String> {
        self.next();
        let name = self.expect_ident(codes::EXPECTED_TERMINAL)?.text;
        self.expect_sym(":", codes::EXPECTED_TERMINAL)?;
        let annotation = self.parse_type_annotation(codes::EXPECTED_TERMINAL)?;
        self.expect_sym("=", codes::EXPECTED_TERMINAL)?;

        match annotation {
            TypeAnnotation::Scalar(ty) => {
                let expr = self.parse_expr()?;
                if !expr.ty.fits(ty) {
                    return Err(self.diag(
                        codes::LET_TYPE_MISMATCH,
                        format!("cannot initialize '{name}: {ty}' from a {} value", expr.ty),
                    ));
                }
                self.expect_sym(";", codes::EXPECTED_TERMINAL)?;
                self.declare(&name, ty);
                Ok(format!("        (let {name} {ty}\n{}        )\n", expr.ir))
            }
            TypeAnnotation::Array(elem, len) => self.parse_array_let(name, elem, len),
            TypeAnnotation::Struct(sname) => self.parse_struct_let(name, sname),
        }
    }

    /// `let a : [T; N] = [V; N];` — one bump allocation plus N slot stores.
    fn parse_array_let(&mut self, name: String, elem: Type, len: usize) -> PResult<String> {
        self.expect_sym("[", codes::EXPECTED_TERMINAL)?;
        let init = self.parse_expr()?;
        if !init.ty.fits(elem) {
            return Err(self.diag(
                codes::LET_TYPE_MISMATCH,
                format!("cannot initialize [{elem}; {len}] slots from a {} value", init.ty),
            ));
        }
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;
        let m_tok = self.expect_num(codes::EXPECTED_TERMINAL)?;
        let m: usize = m_tok
            .text
            .parse()
            .map_err(|_| self.diag(codes::EXPECTED_TERMINAL, "invalid array length"))?;
        self.expect_sym("]", codes::EXPECTED_TERMINAL)?;
        if m != len {
            return Err(self.diag(
                codes::LET_TYPE_MISMATCH,
                format!("array size mismatch: declared {len}, initialized {m}"),
            ));
        }
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;

        self.declare(&name, Type::I32);
        self.state.array_elems.insert(name.clone(), elem);

        let mut out = format!(
            "        (let {name} i32\n          (array_alloc {elem} {len})\n        )\n"
        );
        for slot in 0..len {
            out += &format!(
                "        (expr\n          (array_set {elem}\n          (ident {name})\n          (int {slot})\n{}          )\n        )\n",
                init.ir
            );
        }
        Ok(out)
    }

    /// `let x : S = …;` — either a struct literal or a struct-returning
    /// call; both lower to one `i32` let per field.
    fn parse_struct_let(&mut self, name: String, sname: String) -> PResult<String> {
        let fields = self.struct_fields(&sname).unwrap().to_vec();
        let ctor = self.expect_ident(codes::EXPECTED_TERMINAL)?;

        if self.peek().is_sym("(") {
            let fname = ctor.text;
            let Some(info) = self.fns.get(&fname).cloned() else {
                return Err(self.diag(
                    codes::UNDEFINED_FUNCTION,
                    format!("undefined function '{fname}'"),
                ));
            };
            match &info.ret {
                RetKind::Struct(ret_s) if *ret_s == sname => {}
                _ => {
                    return Err(self.diag(
                        codes::LET_TYPE_MISMATCH,
                        format!("'{fname}' does not return a {sname}"),
                    ));
                }
            }
            self.next();
            let (args, argc) = self.parse_call_args()?;
            self.expect_sym(")", codes::EXPECTED_TERMINAL)?;
            if argc != info.arity {
                return Err(self.diag(
                    codes::CALL_ARITY,
                    format!("'{fname}' expects {} arguments, got {argc}", info.arity),
                ));
            }
            self.expect_sym(";", codes::EXPECTED_TERMINAL)?;

            self.state.local_structs.insert(name.clone(), sname);
            let mut out = String::new();
            for fld in &fields {
                self.declare(&format!("{name}__{fld}"), Type::I32);
                if args.is_empty() {
                    out += &format!(
                        "        (let {name}__{fld} i32\n          (call {fname}__ret__{fld})\n        )\n"
                    );
                } else {
                    out += &format!(
                        "        (let {name}__{fld} i32\n          (call {fname}__ret__{fld}\n{args}          )\n        )\n"
                    );
                }
            }
            return Ok(out);
        }

        if ctor.text != sname {
            return Err(self.diag(
                codes::LET_TYPE_MISMATCH,
                format!("expected struct constructor '{sname}', got '{}'", ctor.text),
            ));
        }
        self.expect_sym("{", codes::EXPECTED_STRUCT_LBRACE)?;
        let vals = self.parse_struct_literal(&sname)?;
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;

        self.state.local_structs.insert(name.clone(), sname);
        let mut out = String::new();
        for fld in &fields {
            self.declare(&format!("{name}__{fld}"), Type::I32);
            out += &format!("        (let {name}__{fld} i32\n{}        )\n", vals[fld]);
        }
        Ok(out)
    }

    /// Field initializers of `S { … }`, with the opening brace already
    /// consumed. Every declared field must appear exactly once.
    fn parse_struct_literal(&mut self, sname: &str) -> PResult<HashMap<String, String>> {
        let fields = self.struct_fields(sname).unwrap().to_vec();
        let mut vals: HashMap<String, String> = HashMap::default();

        while !self.peek().is_sym("}") {
            let fld = self.expect_ident(codes::BAD_STRUCT_FIELD)?.text;
            if !fields.contains(&fld) {
                return Err(self.diag(
                    codes::BAD_STRUCT_FIELD,
                    format!("unknown field '{fld}' for struct {sname}"),
                ));
            }
            if vals.contains_key(&fld) {
                return Err(self.diag(
                    codes::BAD_STRUCT_FIELD,
                    format!("duplicate field '{fld}' for struct {sname}"),
                ));
            }
            self.expect_sym(":", codes::EXPECTED_FIELD_COLON)?;
            let expr = self.parse_expr()?;
            if !expr.ty.fits(Type::I32) {
                return Err(self.diag(
                    codes::LET_TYPE_MISMATCH,
                    format!("field '{fld}' must be i32"),
                ));
            }
            vals.insert(fld, expr.ir);
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym("}", codes::EXPECTED_STRUCT_RBRACE)?;

        for fld in &fields {
            if !vals.contains_key(fld) {
                return Err(self.diag(
                    codes::LET_TYPE_MISMATCH,
                    format!("missing field '{fld}' for struct {sname}"),
                ));
            }
        }
        Ok(vals)
    }

    fn parse_return(&mut self) -> PResult<String> {
        self.next();

        if let Some(fld) = self.state.ret_field.clone() {
            let Some(RetKind::Struct(sname)) = self.state.ret.clone() else {
                unreachable!("return-field context outside a struct-returning function")
            };
            let ctor = self.expect_ident(codes::RETURN_TYPE_MISMATCH)?;
            if ctor.text != sname {
                return Err(self.diag(
                    codes::RETURN_TYPE_MISMATCH,
                    format!("struct-returning function must return a {sname} literal"),
                ));
            }
            self.expect_sym("{", codes::EXPECTED_STRUCT_LBRACE)?;
            let vals = self.parse_struct_literal(&sname)?;
            self.expect_sym(";", codes::EXPECTED_TERMINAL)?;
            return Ok(format!("        (return\n{}        )\n", vals[&fld]));
        }

        let expr = self.parse_expr()?;
        let Some(RetKind::Scalar(ret_ty)) = self.state.ret.clone() else {
            unreachable!("scalar return outside a function")
        };
        if !expr.ty.fits(ret_ty) {
            return Err(self.diag(
                codes::RETURN_TYPE_MISMATCH,
                format!("cannot return a {} value from a {ret_ty} function", expr.ty),
            ));
        }
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;
        Ok(format!("        (return\n{}        )\n", expr.ir))
    }

    fn parse_condition(&mut self) -> PResult<Expr> {
        self.expect_sym("(", codes::EXPECTED_TERMINAL)?;
        let cond = self.parse_expr()?;
        self.expect_sym(")", codes::EXPECTED_TERMINAL)?;
        if !matches!(cond.ty, Type::I32 | Type::Bool) {
            return Err(self.diag(
                codes::COND_TYPE,
                format!("condition must be i32 (0/1), got {}", cond.ty),
            ));
        }
        Ok(cond)
    }

    fn parse_if(&mut self) -> PResult<String> {
        self.next();
        let cond = self.parse_condition()?;
        self.expect_sym("{", codes::EXPECTED_BODY_LBRACE)?;
        let then_block = self.parse_block()?;

        if self.peek().is_ident("else") {
            self.next();
            self.expect_sym("{", codes::EXPECTED_BODY_LBRACE)?;
            let else_block = self.parse_block()?;
            Ok(format!(
                "        (if\n{}{then_block}          (else\n{else_block}          )\n        )\n",
                cond.ir
            ))
        } else {
            Ok(format!("        (if\n{}{then_block}        )\n", cond.ir))
        }
    }

    fn parse_while(&mut self) -> PResult<String> {
        self.next();
        let cond = self.parse_condition()?;
        self.expect_sym("{", codes::EXPECTED_BODY_LBRACE)?;
        let body = self.parse_block()?;
        Ok(format!("        (while\n{}{body}        )\n", cond.ir))
    }

    fn parse_field_assign(&mut self) -> PResult<String> {
        let name = self.next().text;
        self.next();
        let fld = self.expect_ident(codes::BAD_STRUCT_FIELD)?.text;
        self.next();

        let Some(sname) = self.struct_var(&name) else {
            return Err(self.diag(
                codes::TYPE_MISMATCH,
                format!("field assignment on non-struct value '{name}'"),
            ));
        };
        if !self.struct_fields(&sname).unwrap().contains(&fld) {
            return Err(self.diag(
                codes::BAD_STRUCT_FIELD,
                format!("unknown field '{fld}' on struct value '{name}'"),
            ));
        }

        let expr = self.parse_expr()?;
        if !expr.ty.fits(Type::I32) {
            return Err(self.diag(codes::LET_TYPE_MISMATCH, "struct fields are i32"));
        }
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;
        Ok(format!(
            "        (field_assign {name} {fld}\n{}        )\n",
            expr.ir
        ))
    }

    fn parse_assign(&mut self) -> PResult<String> {
        let name = self.next().text;
        self.next();

        if self.struct_var(&name).is_some() {
            return Err(self.diag(
                codes::TYPE_MISMATCH,
                "assigning entire struct values is not supported",
            ));
        }
        let Some(&ty) = self.state.var_types.get(&name) else {
            return Err(self.undefined_local(&name));
        };

        let expr = self.parse_expr()?;
        if !expr.ty.fits(ty) {
            return Err(self.diag(
                codes::LET_TYPE_MISMATCH,
                format!("cannot assign a {} value to '{name}: {ty}'", expr.ty),
            ));
        }
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;
        Ok(format!("        (assign {name}\n{}        )\n", expr.ir))
    }

    fn parse_index_assign(&mut self) -> PResult<String> {
        let name = self.next().text;
        self.next();

        let Some(&elem) = self.state.array_elems.get(&name) else {
            return Err(self.diag(
                codes::TYPE_MISMATCH,
                format!("indexing non-array value '{name}'"),
            ));
        };
        let index = self.parse_expr()?;
        if !index.ty.fits(Type::I32) {
            return Err(self.diag(codes::TYPE_MISMATCH, "array index must be i32"));
        }
        self.expect_sym("]", codes::EXPECTED_TERMINAL)?;
        self.expect_sym("=", codes::EXPECTED_TERMINAL)?;
        let value = self.parse_expr()?;
        if !value.ty.fits(elem) {
            return Err(self.diag(
                codes::LET_TYPE_MISMATCH,
                format!("cannot store a {} value into [{elem}] slots", value.ty),
            ));
        }
        self.expect_sym(";", codes::EXPECTED_TERMINAL)?;

        Ok(format!(
            "        (expr\n          (array_set {elem}\n          (ident {name})\n{}{}          )\n        )\n",
            index.ir, value.ir
        ))
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek().is_sym("||") {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr {
                ir: format!("          (binary or\n{}{}          )\n", lhs.ir, rhs.ir),
                ty: Type::I32,
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_cmp()?;
        while self.peek().is_sym("&&") {
            self.next();
            let rhs = self.parse_cmp()?;
            lhs = Expr {
                ir: format!("          (binary and\n{}{}          )\n", lhs.ir, rhs.ir),
                ty: Type::I32,
            };
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_add()?;
        while self.peek().kind == TokenKind::Sym && CMP_OPS.contains(&self.peek().text.as_str()) {
            let op = self.next().text;
            let rhs = self.parse_add()?;
            // The comparison yields i32 but carries the operand type so the
            // backend picks the right compare instruction.
            let operand_ty = Type::promote(lhs.ty, rhs.ty);
            lhs = Expr {
                ir: binary_ir(op_name(&op), operand_ty, &lhs.ir, &rhs.ir),
                ty: Type::I32,
            };
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_mul()?;
        while self.peek().is_sym("+") || self.peek().is_sym("-") {
            let op = self.next().text;
            let rhs = self.parse_mul()?;
            let ty = Type::promote(lhs.ty, rhs.ty);
            lhs = Expr {
                ir: binary_ir(op_name(&op), ty, &lhs.ir, &rhs.ir),
                ty,
            };
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_term()?;
        while self.peek().is_sym("*") || self.peek().is_sym("/") {
            let op = self.next().text;
            let rhs = self.parse_term()?;
            let ty = Type::promote(lhs.ty, rhs.ty);
            lhs = Expr {
                ir: binary_ir(op_name(&op), ty, &lhs.ir, &rhs.ir),
                ty,
            };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        let t = self.peek().clone();

        if t.is_sym("!") {
            self.next();
            let e = self.parse_term()?;
            return Ok(Expr {
                ir: format!(
                    "          (binary eq\n{}          (int 0)\n          )\n",
                    e.ir
                ),
                ty: Type::I32,
            });
        }
        if t.is_sym("(") {
            self.next();
            let e = self.parse_expr()?;
            self.expect_sym(")", codes::EXPECTED_TERMINAL)?;
            return Ok(e);
        }

        match t.kind {
            TokenKind::Num => {
                self.next();
                self.parse_number_literal(t)
            }
            TokenKind::Str => {
                self.next();
                Ok(Expr {
                    ir: format!("          (string \"{}\")\n", t.text),
                    ty: Type::Str,
                })
            }
            TokenKind::Ident => self.parse_ident_term(),
            _ => Err(self.diag(
                codes::EXPECTED_EXPRESSION,
                format!("expected expression, got '{}'", t.text),
            )),
        }
    }

    fn parse_number_literal(&mut self, t: Token) -> PResult<Expr> {
        let is_float = t.text.contains('.');
        let suffix = if self.peek().kind == TokenKind::Suffix {
            Some(self.next().text)
        } else {
            None
        };

        let (ir, ty) = match suffix.as_deref() {
            Some("i64") => {
                if is_float {
                    return Err(self.diag(
                        codes::EXPECTED_TERMINAL,
                        "float literal cannot carry an i64 suffix",
                    ));
                }
                (format!("          (int_i64 {})\n", t.text), Type::I64)
            }
            Some("f32") => (format!("          (float_f32 {})\n", t.text), Type::F32),
            Some("f64") => (format!("          (float_f64 {})\n", t.text), Type::F64),
            _ if is_float => (format!("          (float_f32 {})\n", t.text), Type::F32),
            _ => (format!("          (int {})\n", t.text), Type::I32),
        };
        Ok(Expr { ir, ty })
    }

    fn parse_ident_term(&mut self) -> PResult<Expr> {
        let t = self.next();
        let name = t.text;

        if name == "true" {
            return Ok(Expr {
                ir: "          (bool 1)\n".to_owned(),
                ty: Type::Bool,
            });
        }
        if name == "false" {
            return Ok(Expr {
                ir: "          (bool 0)\n".to_owned(),
                ty: Type::Bool,
            });
        }

        if self.struct_fields(&name).is_some() && self.peek().is_sym("{") {
            return Err(self.diag(
                codes::EXPECTED_TERMINAL,
                "struct literal is only allowed in a struct 'let' or 'return'",
            ));
        }

        if self.peek().is_sym("(") {
            self.next();
            return self.parse_call(name);
        }

        if self.peek().is_sym(".") {
            self.next();
            let fld = self.expect_ident(codes::BAD_STRUCT_FIELD)?.text;
            let Some(sname) = self.struct_var(&name) else {
                return Err(self.diag(
                    codes::TYPE_MISMATCH,
                    format!("field access on non-struct value '{name}'"),
                ));
            };
            if !self.struct_fields(&sname).unwrap().contains(&fld) {
                return Err(self.diag(
                    codes::BAD_STRUCT_FIELD,
                    format!("unknown field '{fld}' on struct value '{name}'"),
                ));
            }
            return Ok(Expr {
                ir: format!("          (ident {name}__{fld})\n"),
                ty: Type::I32,
            });
        }

        if self.peek().is_sym("[") {
            self.next();
            let Some(&elem) = self.state.array_elems.get(&name) else {
                return Err(self.diag(
                    codes::TYPE_MISMATCH,
                    format!("indexing non-array value '{name}'"),
                ));
            };
            let index = self.parse_expr()?;
            if !index.ty.fits(Type::I32) {
                return Err(self.diag(codes::TYPE_MISMATCH, "array index must be i32"));
            }
            self.expect_sym("]", codes::EXPECTED_TERMINAL)?;
            return Ok(Expr {
                ir: format!(
                    "          (array_get {elem}\n          (ident {name})\n{}          )\n",
                    index.ir
                ),
                ty: elem,
            });
        }

        match self.state.var_types.get(&name) {
            Some(&ty) => Ok(Expr {
                ir: format!("          (ident {name})\n"),
                ty,
            }),
            None => Err(self.undefined_local(&name)),
        }
    }

    /// A call expression with the opening parenthesis already consumed.
    fn parse_call(&mut self, name: String) -> PResult<Expr> {
        if name == "str_len" || name == "str_ptr" {
            let arg = self.parse_expr()?;
            if self.peek().is_sym(",") {
                return Err(self.diag(
                    codes::STR_INTRINSIC_ARITY,
                    format!("'{name}' expects 1 argument"),
                ));
            }
            self.expect_sym(")", codes::EXPECTED_TERMINAL)?;
            return Ok(Expr {
                ir: format!("          ({name}\n{}          )\n", arg.ir),
                ty: Type::I32,
            });
        }

        if let Some(info) = self.fns.get(&name) {
            if matches!(info.ret, RetKind::Struct(_)) {
                return Err(self.diag(
                    codes::TYPE_MISMATCH,
                    format!("struct-returning call to '{name}' must initialize a struct 'let'"),
                ));
            }
        }

        let (args, argc) = self.parse_call_args()?;
        self.expect_sym(")", codes::EXPECTED_TERMINAL)?;

        let ret_ty = if let Some(info) = self.fns.get(&name) {
            if argc != info.arity {
                return Err(self.diag(
                    codes::CALL_ARITY,
                    format!("'{name}' expects {} arguments, got {argc}", info.arity),
                ));
            }
            match info.ret {
                RetKind::Scalar(ty) => ty,
                RetKind::Struct(_) => unreachable!(),
            }
        } else if name.starts_with("__") {
            let Some(&arity) = INTRINSICS.get(name.as_str()) else {
                return Err(self.diag(
                    codes::UNKNOWN_INTRINSIC,
                    format!("unknown intrinsic '{name}'"),
                ));
            };
            if argc != arity {
                return Err(self.diag(
                    intrinsic_arity_code(&name),
                    format!("'{name}' expects {arity} arguments, got {argc}"),
                ));
            }
            Type::I32
        } else {
            // Forward call to a function parsed later; its return type
            // defaults to i32.
            Type::I32
        };

        let ir = if args.is_empty() {
            format!("          (call {name})\n")
        } else {
            format!("          (call {name}\n{args}          )\n")
        };
        Ok(Expr { ir, ty: ret_ty })
    }

    /// Call arguments up to (but not including) the closing parenthesis.
    /// Struct-valued identifiers flatten to per-field identifiers, and
    /// nested struct-returning calls are inlined once per field.
    fn parse_call_args(&mut self) -> PResult<(String, usize)> {
        let mut args = String::new();
        let mut count = 0;

        if self.peek().is_sym(")") {
            return Ok((args, count));
        }

        loop {
            let t = self.peek().clone();
            let t1 = self.peek_at(1).clone();

            if t.kind == TokenKind::Ident && (t1.is_sym(",") || t1.is_sym(")")) {
                if let Some(sname) = self.struct_var(&t.text) {
                    let fields = self.struct_fields(&sname).unwrap().to_vec();
                    self.next();
                    for fld in &fields {
                        args += &format!("          (ident {}__{fld})\n", t.text);
                        count += 1;
                    }
                    if self.eat_sym(",") {
                        continue;
                    }
                    break;
                }
            }

            if t.kind == TokenKind::Ident && t1.is_sym("(") {
                let nested = self.fns.get(&t.text).cloned();
                if let Some(FnInfo {
                    arity,
                    ret: RetKind::Struct(sname),
                }) = nested
                {
                    self.next();
                    self.next();
                    let (inner, inner_count) = self.parse_call_args()?;
                    self.expect_sym(")", codes::EXPECTED_TERMINAL)?;
                    if inner_count != arity {
                        return Err(self.diag(
                            codes::CALL_ARITY,
                            format!("'{}' expects {arity} arguments, got {inner_count}", t.text),
                        ));
                    }
                    let fields = self.struct_fields(&sname).unwrap().to_vec();
                    for fld in &fields {
                        if inner.is_empty() {
                            args += &format!("          (call {}__ret__{fld})\n", t.text);
                        } else {
                            args += &format!(
                                "          (call {}__ret__{fld}\n{inner}          )\n",
                                t.text
                            );
                        }
                        count += 1;
                    }
                    if self.eat_sym(",") {
                        continue;
                    }
                    break;
                }
            }

            let expr = self.parse_expr()?;
            args += &expr.ir;
            count += 1;
            if !self.eat_sym(",") {
                break;
            }
        }

        Ok((args, count))
    }
}

fn binary_ir(op: &str, operand_ty: Type, lhs: &str, rhs: &str) -> String {
    match operand_ty.annotation() {
        Some(ann) => format!("          (binary {op} {ann}\n{lhs}{rhs}          )\n"),
        None => format!("          (binary {op}\n{lhs}{rhs}          )\n"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::lexer::Lexer;

    use super::*;

    fn parse(src: &str) -> Result<String, Diagnostic> {
        let tokens = Lexer::new(src).lex().expect("lexing failed");
        Parser::new(tokens).parse_program()
    }

    #[test]
    fn test_minimal_program() {
        let ir = parse("fn main() -> i32 { return 7; }").unwrap();
        assert!(ir.starts_with("(coatl_ir v1\n"));
        assert!(ir.contains("(fn main\n"));
        assert!(ir.contains("(ret i32)"));
        assert!(ir.contains("(int 7)"));
    }

    #[test]
    fn test_missing_main() {
        let err = parse("fn helper() -> i32 { return 0; }").unwrap_err();
        assert_eq!(err.code, codes::UNDEFINED_FUNCTION);
    }

    #[test]
    fn test_binop_promotion_annotations() {
        let ir = parse(
            "fn main() -> i32 {\n  let a: i64 = 1i64 + 2;\n  let b: f32 = 1.5 * 2.0;\n  let c: f64 = 3f64 / 4f64;\n  return 0;\n}",
        )
        .unwrap();
        assert!(ir.contains("(binary add i64"));
        assert!(ir.contains("(binary mul f32"));
        assert!(ir.contains("(binary div f64"));
        assert!(ir.contains("(int_i64 1)"));
        assert!(ir.contains("(float_f32 1.5)"));
        assert!(ir.contains("(float_f64 3)"));
    }

    #[test]
    fn test_comparison_carries_operand_type() {
        let ir = parse(
            "fn main() -> i32 { let x: f32 = 1.5; if (x < 2.5) { return 1; } return 0; }",
        )
        .unwrap();
        assert!(ir.contains("(binary lt f32"));
    }

    #[test]
    fn test_comparison_of_i32_has_no_annotation() {
        let ir = parse("fn main() -> i32 { if (1 < 2) { return 1; } return 0; }").unwrap();
        assert!(ir.contains("(binary lt\n"));
    }

    #[test]
    fn test_bang_lowers_to_eq_zero() {
        let ir = parse("fn main() -> i32 { if (!0) { return 1; } return 0; }").unwrap();
        assert!(ir.contains("(binary eq\n          (int 0)\n          (int 0)\n"));
    }

    #[test]
    fn test_struct_literal_scalarization() {
        let ir = parse(
            "struct P { x: i32, y: i32 }\nfn main() -> i32 { let p: P = P { x: 2, y: 3 }; return p.x + p.y; }",
        )
        .unwrap();
        assert!(ir.contains("(let p__x i32"));
        assert!(ir.contains("(let p__y i32"));
        assert!(ir.contains("(ident p__x)"));
        assert!(ir.contains("(ident p__y)"));
        // No struct type names survive into the IR expressions.
        assert!(!ir.contains("struct_lit"));
    }

    #[test]
    fn test_struct_literal_field_order_is_declaration_order() {
        let ir = parse(
            "struct P { x: i32, y: i32 }\nfn main() -> i32 { let p: P = P { y: 3, x: 2 }; return p.x; }",
        )
        .unwrap();
        let x_at = ir.find("(let p__x").unwrap();
        let y_at = ir.find("(let p__y").unwrap();
        assert!(x_at < y_at);
    }

    #[test]
    fn test_struct_return_companions() {
        let ir = parse(
            "struct P { x: i32, y: i32 }\nfn mk(a: i32, b: i32) -> P { return P { x: a, y: b }; }\nfn main() -> i32 { let p: P = mk(2, 3); return p.x + p.y; }",
        )
        .unwrap();
        assert!(ir.contains("(fn mk__ret__x\n"));
        assert!(ir.contains("(fn mk__ret__y\n"));
        assert!(!ir.contains("(fn mk\n"));
        assert!(ir.contains("(call mk__ret__x"));
        assert!(ir.contains("(call mk__ret__y"));
    }

    #[test]
    fn test_struct_param_flattening() {
        let ir = parse(
            "struct P { x: i32, y: i32 }\nfn get_x(p: P) -> i32 { return p.x; }\nfn main() -> i32 { let p: P = P { x: 1, y: 2 }; return get_x(p); }",
        )
        .unwrap();
        assert!(ir.contains("(param p__x i32)"));
        assert!(ir.contains("(param p__y i32)"));
        assert!(ir.contains("(ident p__x)\n          (ident p__y)\n"));
    }

    #[test]
    fn test_field_assign_statement() {
        let ir = parse(
            "struct P { x: i32, y: i32 }\nfn main() -> i32 { let p: P = P { x: 1, y: 2 }; p.x = 5; return p.x; }",
        )
        .unwrap();
        assert!(ir.contains("(field_assign p x\n"));
    }

    #[test]
    fn test_struct_literal_missing_field() {
        let err = parse(
            "struct P { x: i32, y: i32 }\nfn main() -> i32 { let p: P = P { x: 1 }; return 0; }",
        )
        .unwrap_err();
        assert_eq!(err.code, codes::LET_TYPE_MISMATCH);
    }

    #[test]
    fn test_struct_literal_unknown_field() {
        let err = parse(
            "struct P { x: i32 }\nfn main() -> i32 { let p: P = P { x: 1, z: 2 }; return 0; }",
        )
        .unwrap_err();
        assert_eq!(err.code, codes::BAD_STRUCT_FIELD);
    }

    #[test]
    fn test_array_let_lowering() {
        let ir = parse("fn main() -> i32 { let a: [i32; 3] = [0; 3]; return a[0]; }").unwrap();
        assert!(ir.contains("(array_alloc i32 3)"));
        assert_eq!(ir.matches("(array_set i32").count(), 3);
        assert!(ir.contains("(array_get i32"));
    }

    #[test]
    fn test_array_size_mismatch() {
        let err = parse("fn main() -> i32 { let a: [i32; 3] = [0; 4]; return 0; }").unwrap_err();
        assert_eq!(err.code, codes::LET_TYPE_MISMATCH);
        assert!(err.msg.contains("size mismatch"));
    }

    #[test]
    fn test_index_assignment_lowering() {
        let ir = parse(
            "fn main() -> i32 { let a: [i32; 2] = [0; 2]; a[1] = 9; return a[1]; }",
        )
        .unwrap();
        // Two init stores plus the explicit one.
        assert_eq!(ir.matches("(array_set i32").count(), 3);
    }

    #[test]
    fn test_undefined_local_code() {
        let err = parse("fn main() -> i32 { return nope; }").unwrap_err();
        assert_eq!(err.code, codes::UNDEFINED_LOCAL_BASE);
        let err = parse("fn main() -> i32 { let a: i32 = 1; return nope; }").unwrap_err();
        assert_eq!(err.code, codes::UNDEFINED_LOCAL_BASE + 1);
    }

    #[test]
    fn test_intrinsic_arity_codes() {
        let err = parse("fn main() -> i32 { return __fd_write(1, 2); }").unwrap_err();
        assert_eq!(err.code, codes::FD_RW_ARITY);
        let err = parse("fn main() -> i32 { return __nope(); }").unwrap_err();
        assert_eq!(err.code, codes::UNKNOWN_INTRINSIC);
    }

    #[test]
    fn test_string_intrinsics() {
        let ir = parse(
            "fn main() -> i32 { let s: str = \"hi\\n\"; return str_len(s) + str_ptr(s); }",
        )
        .unwrap();
        assert!(ir.contains("(string \"hi\\x0a\")"));
        assert!(ir.contains("(str_len\n"));
        assert!(ir.contains("(str_ptr\n"));
    }

    #[test]
    fn test_let_type_mismatch() {
        let err = parse("fn main() -> i32 { let x: i32 = 1.5; return 0; }").unwrap_err();
        assert_eq!(err.code, codes::LET_TYPE_MISMATCH);
    }

    #[test]
    fn test_condition_must_be_int() {
        let err = parse("fn main() -> i32 { if (1.5) { return 1; } return 0; }").unwrap_err();
        assert_eq!(err.code, codes::COND_TYPE);
    }

    #[test]
    fn test_while_loop_shape() {
        let ir = parse(
            "fn main() -> i32 { let i: i32 = 0; while (i < 5) { i = i + 1; } return i; }",
        )
        .unwrap();
        assert!(ir.contains("(while\n"));
        assert!(ir.contains("(assign i\n"));
    }

    #[test]
    fn test_diagnostic_positions() {
        let err = parse("fn main() -> i32 { let x: i32 = ; }").unwrap_err();
        assert_eq!(err.code, codes::EXPECTED_EXPRESSION);
        assert_eq!(err.line, 1);
        assert!(err.col > 1);
    }
}
