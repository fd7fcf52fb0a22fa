//! IR → x86-64 assembly backend.
//!
//! Single pass, stack-machine style. Every expression leaves its result in
//! `rax` (bitwise in `rax`/`eax` for floats, staged with `movd`/`movq`);
//! binary operators spill the left operand to the stack; calls follow the
//! System V AMD64 convention with six integer registers, eight XMM
//! registers, and 16-byte stack alignment at the `call` instruction.
//! A stack-depth counter tracks every push and pop; it must return to zero
//! at the end of each function.
mod prelude;
mod strings;

use std::collections::HashMap;
use std::fmt::Write as _;

use thiserror::Error;

use InstructionOperand::*;
use InstructionSize::*;
use Reg::*;

use crate::{
    asm::{Cond, Instruction, InstructionOperand, InstructionSize, Reg, ARG_REGS},
    ir::{IrError, Node},
    parser::Type,
};

use self::strings::StringTable;
pub use self::strings::STRING_BASE;

/// Linear-memory offset of the bump-heap pointer.
const HEAP_PTR_ADDR: u32 = 4096;
/// First address handed out by the bump allocator.
const HEAP_START: i64 = 8192;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("unsupported IR root (expected coatl_ir v1)")]
    UnsupportedRoot,
    #[error("malformed {0} node")]
    BadShape(&'static str),
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unsupported binary op '{0}'")]
    UnsupportedOp(String),
    #[error("unknown binary op type annotation '{0}'")]
    UnknownAnnotation(String),
    #[error("unsupported type '{0}'")]
    BadType(String),
    #[error("unsupported statement '{0}'")]
    UnsupportedStmt(String),
    #[error("unsupported expression '{0}'")]
    UnsupportedExpr(String),
    #[error("invalid literal '{0}'")]
    BadLiteral(String),
    #[error("string literal missing from the interning table: {0}")]
    MissingString(String),
    #[error("call to '{0}' has {1} arguments, expected {2}")]
    ArityMismatch(String, usize, usize),
    #[error("stack depth {1} left over after function '{0}'")]
    StackDepth(String, usize),
    #[error(transparent)]
    Ir(#[from] IrError),
}

type LResult<T> = Result<T, LowerError>;

fn as_list<'a>(node: &'a Node, what: &'static str) -> LResult<&'a [Node]> {
    node.as_list().ok_or(LowerError::BadShape(what))
}

fn as_atom<'a>(node: &'a Node, what: &'static str) -> LResult<&'a str> {
    node.as_atom().ok_or(LowerError::BadShape(what))
}

fn parse_type(atom: &str) -> LResult<Type> {
    atom.parse()
        .map_err(|_| LowerError::BadType(atom.to_owned()))
}

#[derive(Debug, Clone)]
struct FnSig {
    params: Vec<Type>,
    ret: Type,
}

/// Lower a parsed `coatl_ir v1` tree to assembly text.
pub fn lower(root: &Node) -> LResult<String> {
    Codegen::from_root(root)?.emit()
}

struct Codegen<'a> {
    /// Function nodes in document order.
    functions: Vec<&'a [Node]>,
    /// Parameter names and types per function, in document order.
    fn_params: HashMap<String, Vec<(String, Type)>>,
    sigs: HashMap<String, FnSig>,
    strings: StringTable,
}

impl<'a> Codegen<'a> {
    fn from_root(root: &'a Node) -> LResult<Self> {
        let top = as_list(root, "root")?;
        if top.len() != 4
            || top[0].as_atom() != Some("coatl_ir")
            || top[1].as_atom() != Some("v1")
        {
            return Err(LowerError::UnsupportedRoot);
        }
        if as_list(&top[2], "structs")?.first().and_then(Node::as_atom) != Some("structs") {
            return Err(LowerError::UnsupportedRoot);
        }
        let fns_node = as_list(&top[3], "functions")?;
        if fns_node.first().and_then(Node::as_atom) != Some("functions") {
            return Err(LowerError::UnsupportedRoot);
        }

        let mut cg = Codegen {
            functions: vec![],
            fn_params: HashMap::default(),
            sigs: HashMap::default(),
            strings: StringTable::default(),
        };

        // Signature pre-pass, then the string pre-pass; the interning table
        // is frozen before any function body is emitted.
        for f in &fns_node[1..] {
            let items = as_list(f, "fn")?;
            if items.len() != 5 || items[0].as_atom() != Some("fn") {
                return Err(LowerError::BadShape("fn"));
            }
            let name = as_atom(&items[1], "fn name")?;

            let params_node = as_list(&items[2], "params")?;
            if params_node.first().and_then(Node::as_atom) != Some("params") {
                return Err(LowerError::BadShape("params"));
            }
            let mut params = vec![];
            for p in &params_node[1..] {
                let pl = as_list(p, "param")?;
                if pl.len() != 3 || pl[0].as_atom() != Some("param") {
                    return Err(LowerError::BadShape("param"));
                }
                let pname = as_atom(&pl[1], "param name")?;
                let pty = parse_type(as_atom(&pl[2], "param type")?)?;
                params.push((pname.to_owned(), pty));
            }

            let ret_node = as_list(&items[3], "ret")?;
            if ret_node.len() != 2 || ret_node[0].as_atom() != Some("ret") {
                return Err(LowerError::BadShape("ret"));
            }
            let ret = parse_type(as_atom(&ret_node[1], "ret type")?)?;

            cg.sigs.insert(
                name.to_owned(),
                FnSig {
                    params: params.iter().map(|(_, t)| *t).collect(),
                    ret,
                },
            );
            cg.fn_params.insert(name.to_owned(), params);
            cg.functions.push(items);
        }

        for f in &cg.functions.clone() {
            let block = as_list(&f[4], "block")?;
            walk_block_strings(block, &mut cg.strings)?;
        }

        Ok(cg)
    }

    fn sig_of(&self, name: &str) -> Option<FnSig> {
        self.sigs.get(name).cloned().or_else(|| {
            prelude::INTRINSIC_SIGS
                .get(name)
                .map(|(params, ret)| FnSig {
                    params: params.clone(),
                    ret: *ret,
                })
        })
    }

    fn emit(&self) -> LResult<String> {
        let mut out = String::new();
        out += ".intel_syntax noprefix\n";
        out += ".text\n";
        out += ".globl coatl_start\n";
        for f in &self.functions {
            let name = as_atom(&f[1], "fn name")?;
            let _ = writeln!(out, ".globl {name}");
        }

        for ins in prelude::init_memory_routine(&self.strings) {
            let _ = writeln!(out, "{ins}");
        }
        for ins in prelude::routines() {
            let _ = writeln!(out, "{ins}");
        }

        for f in &self.functions {
            let emitter = FnEmitter::new(self);
            for ins in emitter.emit_function(f)? {
                let _ = writeln!(out, "{ins}");
            }
        }

        out += "\n.bss\n.balign 16\n__coatl_mem:\n\t.zero 1048576\n__coatl_mem_inited:\n\t.zero 4\n";
        Ok(out)
    }
}

fn walk_block_strings(block: &[Node], table: &mut StringTable) -> LResult<()> {
    if block.first().and_then(Node::as_atom) != Some("block") {
        return Err(LowerError::BadShape("block"));
    }
    for stmt in &block[1..] {
        walk_stmt_strings(stmt, table)?;
    }
    Ok(())
}

fn walk_stmt_strings(stmt: &Node, table: &mut StringTable) -> LResult<()> {
    let s = as_list(stmt, "stmt")?;
    match s.first().and_then(Node::as_atom) {
        Some("let") if s.len() == 4 => walk_expr_strings(&s[3], table),
        Some("assign") if s.len() == 3 => walk_expr_strings(&s[2], table),
        Some("field_assign") if s.len() == 4 => walk_expr_strings(&s[3], table),
        Some("return") | Some("expr") if s.len() == 2 => walk_expr_strings(&s[1], table),
        Some("if") if s.len() >= 3 => {
            walk_expr_strings(&s[1], table)?;
            walk_block_strings(as_list(&s[2], "block")?, table)?;
            if s.len() > 3 {
                let eb = as_list(&s[3], "else")?;
                if eb.len() == 2 && eb[0].as_atom() == Some("else") {
                    walk_block_strings(as_list(&eb[1], "block")?, table)?;
                }
            }
            Ok(())
        }
        Some("while") if s.len() == 3 => {
            walk_expr_strings(&s[1], table)?;
            walk_block_strings(as_list(&s[2], "block")?, table)
        }
        _ => Ok(()),
    }
}

fn walk_expr_strings(expr: &Node, table: &mut StringTable) -> LResult<()> {
    let e = as_list(expr, "expr")?;
    match e.first().and_then(Node::as_atom) {
        Some("string") if e.len() == 2 => {
            table.intern(as_atom(&e[1], "string")?)?;
            Ok(())
        }
        Some("binary") => {
            for operand in &e[e.len().saturating_sub(2)..] {
                walk_expr_strings(operand, table)?;
            }
            Ok(())
        }
        Some("call") => {
            for arg in &e[2..] {
                walk_expr_strings(arg, table)?;
            }
            Ok(())
        }
        Some("str_len") | Some("str_ptr") if e.len() == 2 => walk_expr_strings(&e[1], table),
        Some("array_set") if e.len() == 5 => {
            walk_expr_strings(&e[2], table)?;
            walk_expr_strings(&e[3], table)?;
            walk_expr_strings(&e[4], table)
        }
        Some("array_get") if e.len() == 4 => {
            walk_expr_strings(&e[2], table)?;
            walk_expr_strings(&e[3], table)
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy)]
struct Local {
    offset: i64,
    ty: Type,
}

struct FnEmitter<'a> {
    cg: &'a Codegen<'a>,
    name: String,
    locals: HashMap<String, Local>,
    frame: i64,
    ins: Vec<Instruction>,
    label_count: usize,
    depth: usize,
}

impl<'a> FnEmitter<'a> {
    fn new(cg: &'a Codegen<'a>) -> Self {
        Self {
            cg,
            name: String::new(),
            locals: HashMap::default(),
            frame: 0,
            ins: vec![],
            label_count: 0,
            depth: 0,
        }
    }

    fn emit_function(mut self, items: &[Node]) -> LResult<Vec<Instruction>> {
        use Instruction::*;

        self.name = as_atom(&items[1], "fn name")?.to_owned();
        let params = self.cg.fn_params[&self.name].clone();
        let ret = self.cg.sigs[&self.name].ret;
        let block = as_list(&items[4], "block")?;

        // Locals are the parameters plus every `let` in the block tree,
        // each in one 8-byte slot at a name-sorted offset below rbp.
        let mut local_types: HashMap<String, Type> = HashMap::default();
        for (pname, pty) in &params {
            local_types.insert(pname.clone(), *pty);
        }
        collect_locals(block, &mut local_types)?;

        let mut names: Vec<&String> = local_types.keys().collect();
        names.sort();
        for (i, lname) in names.iter().enumerate() {
            self.locals.insert(
                (*lname).clone(),
                Local {
                    offset: 8 * (i as i64 + 1),
                    ty: local_types[*lname],
                },
            );
        }
        self.frame = (8 * local_types.len() as i64 + 15) / 16 * 16;

        self.ins.push(Label(self.name.clone()));
        self.ins.push(Push(Rbp));
        self.ins.push(Mov(Register(Rbp), Register(Rsp)));
        self.ins.push(Sub(Register(Rsp), Immediate(self.frame)));

        self.spill_params(&params);
        self.ins.push(Call("__coatl_init_memory".to_owned()));

        for stmt in &block[1..] {
            self.emit_stmt(stmt)?;
        }

        // Falling off the end returns 0.
        self.ins.push(Mov(Register(Eax), Immediate(0)));
        self.ins.push(Label(self.ret_label()));
        match ret {
            Type::F32 => self.ins.push(Movd(Register(Xmm(0)), Register(Eax))),
            Type::F64 => self.ins.push(Movq(Register(Xmm(0)), Register(Rax))),
            _ => {}
        }
        self.ins.push(Add(Register(Rsp), Immediate(self.frame)));
        self.ins.push(Pop(Rbp));
        self.ins.push(Ret);

        if self.depth != 0 {
            return Err(LowerError::StackDepth(self.name.clone(), self.depth));
        }
        Ok(self.ins)
    }

    /// Move parameters from their ABI slots into the frame. Overflow
    /// parameters take their stack slot from their order among all overflow
    /// parameters, regardless of class.
    fn spill_params(&mut self, params: &[(String, Type)]) {
        use Instruction::*;

        let mut int_i = 0;
        let mut float_j = 0;
        let mut overflow = 0;
        for (pname, pty) in params {
            let local = self.locals[pname];
            let size = InstructionSize::from(*pty);
            let slot = Memory(size, format!("{}-{}", Rbp, local.offset));
            self.ins.push(Comment(format!("spill {pname}")));

            if pty.is_float() {
                if float_j < 8 {
                    match pty {
                        Type::F32 => {
                            self.ins.push(Movd(Register(Eax), Register(Xmm(float_j))));
                            self.ins.push(Mov(slot, Register(Eax)));
                        }
                        _ => {
                            self.ins.push(Movq(Register(Rax), Register(Xmm(float_j))));
                            self.ins.push(Mov(slot, Register(Rax)));
                        }
                    }
                } else {
                    let acc = Rax.sized(size);
                    self.ins.push(Mov(
                        Register(acc),
                        Memory(size, format!("{}+{}", Rbp, 16 + 8 * overflow)),
                    ));
                    self.ins.push(Mov(slot, Register(acc)));
                    overflow += 1;
                }
                float_j += 1;
            } else {
                if int_i < 6 {
                    self.ins.push(Mov(slot, Register(ARG_REGS[int_i].sized(size))));
                } else {
                    let acc = Rax.sized(size);
                    self.ins.push(Mov(
                        Register(acc),
                        Memory(size, format!("{}+{}", Rbp, 16 + 8 * overflow)),
                    ));
                    self.ins.push(Mov(slot, Register(acc)));
                    overflow += 1;
                }
                int_i += 1;
            }
        }
    }

    fn ret_label(&self) -> String {
        format!(".L{}_ret", self.name)
    }

    fn label(&mut self) -> usize {
        self.label_count += 1;
        self.label_count
    }

    fn push(&mut self, reg: Reg) {
        self.ins.push(Instruction::Push(reg));
        self.depth += 1;
    }

    fn pop(&mut self, reg: Reg) {
        self.ins.push(Instruction::Pop(reg));
        self.depth -= 1;
    }

    fn local(&self, name: &str) -> LResult<Local> {
        self.locals
            .get(name)
            .copied()
            .ok_or_else(|| LowerError::UnknownIdentifier(name.to_owned()))
    }

    fn store_local(&mut self, name: &str) -> LResult<()> {
        let local = self.local(name)?;
        let size = InstructionSize::from(local.ty);
        self.ins.push(Instruction::Mov(
            Memory(size, format!("{}-{}", Rbp, local.offset)),
            Register(Rax.sized(size)),
        ));
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &Node) -> LResult<()> {
        use Instruction::*;

        let s = as_list(stmt, "stmt")?;
        let tag = s
            .first()
            .and_then(Node::as_atom)
            .ok_or(LowerError::BadShape("stmt"))?;
        match tag {
            "let" if s.len() == 4 => {
                let name = as_atom(&s[1], "let name")?.to_owned();
                parse_type(as_atom(&s[2], "let type")?)?;
                self.ins.push(Comment(format!("let {name}")));
                self.emit_expr(&s[3])?;
                self.store_local(&name)
            }
            "assign" if s.len() == 3 => {
                let name = as_atom(&s[1], "assign name")?.to_owned();
                self.ins.push(Comment(format!("{name} = …")));
                self.emit_expr(&s[2])?;
                self.store_local(&name)
            }
            "field_assign" if s.len() == 4 => {
                let base = as_atom(&s[1], "field_assign var")?;
                let field = as_atom(&s[2], "field_assign field")?;
                let name = format!("{base}__{field}");
                self.ins.push(Comment(format!("{base}.{field} = …")));
                self.emit_expr(&s[3])?;
                self.store_local(&name)
            }
            "return" if s.len() == 2 => {
                self.emit_expr(&s[1])?;
                self.ins.push(Jmp(self.ret_label()));
                Ok(())
            }
            "expr" if s.len() == 2 => self.emit_expr(&s[1]),
            "if" => self.emit_if(s),
            "while" if s.len() == 3 => self.emit_while(s),
            _ => Err(LowerError::UnsupportedStmt(tag.to_owned())),
        }
    }

    fn emit_if(&mut self, s: &[Node]) -> LResult<()> {
        use Instruction::*;

        if s.len() != 3 && s.len() != 4 {
            return Err(LowerError::BadShape("if"));
        }
        let n = self.label();
        let else_label = format!(".L{}_else_{}", self.name, n);
        let end_label = format!(".L{}_end_{}", self.name, n);

        let else_block = if s.len() == 4 {
            let eb = as_list(&s[3], "else")?;
            if eb.len() != 2 || eb[0].as_atom() != Some("else") {
                return Err(LowerError::BadShape("else"));
            }
            Some(as_list(&eb[1], "block")?)
        } else {
            None
        };

        self.emit_expr(&s[1])?;
        self.ins.push(Test(Register(Eax), Register(Eax)));
        self.ins.push(Je(if else_block.is_some() {
            else_label.clone()
        } else {
            end_label.clone()
        }));

        let then_block = as_list(&s[2], "block")?;
        self.emit_block(then_block)?;

        if let Some(eb) = else_block {
            self.ins.push(Jmp(end_label.clone()));
            self.ins.push(Label(else_label));
            self.emit_block(eb)?;
        }
        self.ins.push(Label(end_label));
        Ok(())
    }

    fn emit_while(&mut self, s: &[Node]) -> LResult<()> {
        use Instruction::*;

        let n = self.label();
        let cond_label = format!(".L{}_cond_{}", self.name, n);
        let end_label = format!(".L{}_end_{}", self.name, n);

        self.ins.push(Label(cond_label.clone()));
        self.emit_expr(&s[1])?;
        self.ins.push(Test(Register(Eax), Register(Eax)));
        self.ins.push(Je(end_label.clone()));
        self.emit_block(as_list(&s[2], "block")?)?;
        self.ins.push(Jmp(cond_label));
        self.ins.push(Label(end_label));
        Ok(())
    }

    fn emit_block(&mut self, block: &[Node]) -> LResult<()> {
        if block.first().and_then(Node::as_atom) != Some("block") {
            return Err(LowerError::BadShape("block"));
        }
        for stmt in &block[1..] {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_expr(&mut self, expr: &Node) -> LResult<()> {
        use Instruction::*;

        let e = as_list(expr, "expr")?;
        let tag = e
            .first()
            .and_then(Node::as_atom)
            .ok_or(LowerError::BadShape("expr"))?;
        match tag {
            "int" if e.len() == 2 => {
                let text = as_atom(&e[1], "int")?;
                let value: i32 = text
                    .parse()
                    .map_err(|_| LowerError::BadLiteral(text.to_owned()))?;
                self.ins.push(Mov(Register(Eax), Immediate(i64::from(value))));
                Ok(())
            }
            "int_i64" if e.len() == 2 => {
                let text = as_atom(&e[1], "int_i64")?;
                let value: i64 = text
                    .parse()
                    .map_err(|_| LowerError::BadLiteral(text.to_owned()))?;
                self.ins.push(Movabs(Register(Rax), Immediate(value)));
                Ok(())
            }
            "float_f32" if e.len() == 2 => {
                let text = as_atom(&e[1], "float_f32")?;
                let value: f32 = text
                    .parse()
                    .map_err(|_| LowerError::BadLiteral(text.to_owned()))?;
                self.ins.push(Mov(
                    Register(Eax),
                    Immediate(i64::from(value.to_bits())),
                ));
                Ok(())
            }
            "float_f64" if e.len() == 2 => {
                let text = as_atom(&e[1], "float_f64")?;
                let value: f64 = text
                    .parse()
                    .map_err(|_| LowerError::BadLiteral(text.to_owned()))?;
                self.ins.push(Movabs(
                    Register(Rax),
                    Immediate(value.to_bits() as i64),
                ));
                Ok(())
            }
            "bool" if e.len() == 2 => {
                let text = as_atom(&e[1], "bool")?;
                let value: i64 = match text {
                    "0" => 0,
                    "1" => 1,
                    _ => return Err(LowerError::BadLiteral(text.to_owned())),
                };
                self.ins.push(Mov(Register(Eax), Immediate(value)));
                Ok(())
            }
            "string" if e.len() == 2 => {
                let token = as_atom(&e[1], "string")?;
                let addr = self
                    .cg
                    .strings
                    .address_of(token)
                    .ok_or_else(|| LowerError::MissingString(token.to_owned()))?;
                self.ins.push(Mov(Register(Eax), Immediate(i64::from(addr))));
                Ok(())
            }
            "ident" if e.len() == 2 => {
                let name = as_atom(&e[1], "ident")?;
                let local = self.local(name)?;
                let size = InstructionSize::from(local.ty);
                self.ins.push(Mov(
                    Register(Rax.sized(size)),
                    Memory(size, format!("{}-{}", Rbp, local.offset)),
                ));
                Ok(())
            }
            "binary" if e.len() == 4 || e.len() == 5 => self.emit_binary(e),
            "call" if e.len() >= 2 => self.emit_call(e),
            "array_alloc" if e.len() == 3 => self.emit_array_alloc(e),
            "array_set" if e.len() == 5 => self.emit_array_set(e),
            "array_get" if e.len() == 4 => self.emit_array_get(e),
            "str_len" if e.len() == 2 => {
                self.emit_expr(&e[1])?;
                self.lea_mem_base();
                self.ins.push(Mov(
                    Register(Eax),
                    Memory(Dword, format!("{}+{}+4", R11, Rax)),
                ));
                Ok(())
            }
            "str_ptr" if e.len() == 2 => {
                self.emit_expr(&e[1])?;
                self.lea_mem_base();
                self.ins.push(Mov(
                    Register(Eax),
                    Memory(Dword, format!("{}+{}", R11, Rax)),
                ));
                Ok(())
            }
            _ => Err(LowerError::UnsupportedExpr(tag.to_owned())),
        }
    }

    fn lea_mem_base(&mut self) {
        self.ins.push(Instruction::Lea(
            Register(R11),
            Identifier("__coatl_mem[rip]".to_owned()),
        ));
    }

    /// LHS, push, RHS into rcx, pop LHS back into rax, apply.
    fn emit_binary(&mut self, e: &[Node]) -> LResult<()> {
        use Instruction::*;

        let op = as_atom(&e[1], "binary op")?.to_owned();
        let (ty, lhs, rhs) = match e.len() {
            4 => (Type::I32, &e[2], &e[3]),
            5 => {
                let ann = as_atom(&e[2], "binary annotation")?;
                let ty = ann
                    .parse::<Type>()
                    .map_err(|_| LowerError::UnknownAnnotation(ann.to_owned()))?;
                if !matches!(ty, Type::I64 | Type::F32 | Type::F64) {
                    return Err(LowerError::UnknownAnnotation(ann.to_owned()));
                }
                (ty, &e[3], &e[4])
            }
            _ => return Err(LowerError::BadShape("binary")),
        };

        self.emit_expr(lhs)?;
        self.push(Rax);
        self.emit_expr(rhs)?;
        self.ins.push(Mov(Register(Rcx), Register(Rax)));
        self.pop(Rax);

        let size = InstructionSize::from(ty);
        let acc = Rax.sized(size);
        let rhs_reg = Rcx.sized(size);

        if ty.is_float() {
            let (mnem, is_cmp) = float_op(&op, ty)?;
            if ty == Type::F32 {
                self.ins.push(Movd(Register(Xmm(0)), Register(Eax)));
                self.ins.push(Movd(Register(Xmm(1)), Register(Ecx)));
            } else {
                self.ins.push(Movq(Register(Xmm(0)), Register(Rax)));
                self.ins.push(Movq(Register(Xmm(1)), Register(Rcx)));
            }
            self.ins.push(Sse(mnem, Xmm(0), Xmm(1)));
            if is_cmp {
                self.ins.push(Set(float_cond(&op), Register(Al)));
                self.ins.push(Movzx(Register(Eax), Register(Al)));
            } else if ty == Type::F32 {
                self.ins.push(Movd(Register(Eax), Register(Xmm(0))));
            } else {
                self.ins.push(Movq(Register(Rax), Register(Xmm(0))));
            }
            return Ok(());
        }

        match op.as_str() {
            "add" => self.ins.push(Add(Register(acc), Register(rhs_reg))),
            "sub" => self.ins.push(Sub(Register(acc), Register(rhs_reg))),
            "mul" => self.ins.push(Imul(Register(acc), Register(rhs_reg))),
            "div" => {
                if ty == Type::I64 {
                    self.ins.push(Cqo);
                } else {
                    self.ins.push(Cdq);
                }
                self.ins.push(Idiv(Register(rhs_reg)));
            }
            "and" => self.ins.push(And(Register(acc), Register(rhs_reg))),
            "or" => self.ins.push(Or(Register(acc), Register(rhs_reg))),
            "eq" | "ne" | "lt" | "gt" | "le" | "ge" => {
                self.ins.push(Cmp(Register(acc), Register(rhs_reg)));
                self.ins.push(Set(int_cond(&op), Register(Al)));
                self.ins.push(Movzx(Register(Eax), Register(Al)));
            }
            _ => return Err(LowerError::UnsupportedOp(op)),
        }
        Ok(())
    }

    /// Arguments are evaluated in reverse source order and pushed, then
    /// popped into their destination registers in parameter order; stack
    /// arguments stay in place. One quadword of padding keeps the stack
    /// 16-byte aligned at the `call` instruction.
    fn emit_call(&mut self, e: &[Node]) -> LResult<()> {
        use Instruction::*;

        let name = as_atom(&e[1], "call target")?.to_owned();
        let args = &e[2..];
        let sig = self
            .cg
            .sig_of(&name)
            .ok_or_else(|| LowerError::UnknownFunction(name.clone()))?;
        if args.len() != sig.params.len() {
            return Err(LowerError::ArityMismatch(
                name,
                args.len(),
                sig.params.len(),
            ));
        }

        let n_int = sig.params.iter().filter(|t| !t.is_float()).count();
        let n_float = sig.params.len() - n_int;
        let stack_args = n_int.saturating_sub(6) + n_float.saturating_sub(8);

        let pad = (self.depth + stack_args) % 2;
        if pad == 1 {
            self.ins.push(Sub(Register(Rsp), Immediate(8)));
            self.depth += 1;
        }

        for arg in args.iter().rev() {
            self.emit_expr(arg)?;
            self.push(Rax);
        }

        let mut int_i = 0;
        let mut float_j = 0;
        for ty in &sig.params {
            if ty.is_float() {
                if float_j < 8 {
                    self.pop(Rax);
                    if *ty == Type::F32 {
                        self.ins.push(Movd(Register(Xmm(float_j)), Register(Eax)));
                    } else {
                        self.ins.push(Movq(Register(Xmm(float_j)), Register(Rax)));
                    }
                }
                float_j += 1;
            } else {
                if int_i < 6 {
                    self.pop(ARG_REGS[int_i]);
                }
                int_i += 1;
            }
        }

        debug_assert_eq!(self.depth % 2, 0, "stack misaligned at call");
        self.ins.push(Comment(format!("call {name}")));
        self.ins.push(Call(name));

        let cleanup = stack_args + pad;
        if cleanup > 0 {
            self.ins
                .push(Add(Register(Rsp), Immediate(8 * cleanup as i64)));
            self.depth -= cleanup;
        }

        match sig.ret {
            Type::F32 => self.ins.push(Movd(Register(Eax), Register(Xmm(0)))),
            Type::F64 => self.ins.push(Movq(Register(Rax), Register(Xmm(0)))),
            _ => {}
        }
        Ok(())
    }

    /// Bump allocation: load the heap pointer, seed it lazily, store back
    /// `old + 4*N`, leave `old` in rax.
    fn emit_array_alloc(&mut self, e: &[Node]) -> LResult<()> {
        use Instruction::*;

        parse_type(as_atom(&e[1], "array_alloc element")?)?;
        let text = as_atom(&e[2], "array_alloc length")?;
        let len: i64 = text
            .parse()
            .map_err(|_| LowerError::BadLiteral(text.to_owned()))?;

        let label = self.label();
        let seeded = format!(".L{}_bump_{}", self.name, label);
        self.lea_mem_base();
        self.ins.push(Mov(
            Register(Eax),
            Memory(Dword, format!("{}+{}", R11, HEAP_PTR_ADDR)),
        ));
        self.ins.push(Test(Register(Eax), Register(Eax)));
        self.ins.push(Jne(seeded.clone()));
        self.ins.push(Mov(Register(Eax), Immediate(HEAP_START)));
        self.ins.push(Label(seeded));
        self.ins.push(Mov(Register(Ecx), Register(Eax)));
        self.ins.push(Add(Register(Ecx), Immediate(4 * len)));
        self.ins.push(Mov(
            Memory(Dword, format!("{}+{}", R11, HEAP_PTR_ADDR)),
            Register(Ecx),
        ));
        Ok(())
    }

    fn emit_array_set(&mut self, e: &[Node]) -> LResult<()> {
        use Instruction::*;

        parse_type(as_atom(&e[1], "array_set element")?)?;
        self.emit_expr(&e[2])?;
        self.push(Rax);
        self.emit_expr(&e[3])?;
        self.push(Rax);
        self.emit_expr(&e[4])?;
        self.pop(Rcx);
        self.pop(Rdx);
        self.ins.push(Lea(
            Register(Edx),
            Identifier(format!("[{}+{}*4]", Rdx, Rcx)),
        ));
        self.lea_mem_base();
        self.ins.push(Mov(
            Memory(Dword, format!("{}+{}", R11, Rdx)),
            Register(Eax),
        ));
        Ok(())
    }

    fn emit_array_get(&mut self, e: &[Node]) -> LResult<()> {
        use Instruction::*;

        parse_type(as_atom(&e[1], "array_get element")?)?;
        self.emit_expr(&e[2])?;
        self.push(Rax);
        self.emit_expr(&e[3])?;
        self.pop(Rcx);
        self.ins.push(Lea(
            Register(Ecx),
            Identifier(format!("[{}+{}*4]", Rcx, Rax)),
        ));
        self.lea_mem_base();
        self.ins.push(Mov(
            Register(Eax),
            Memory(Dword, format!("{}+{}", R11, Rcx)),
        ));
        Ok(())
    }
}

fn collect_locals(block: &[Node], out: &mut HashMap<String, Type>) -> LResult<()> {
    if block.first().and_then(Node::as_atom) != Some("block") {
        return Err(LowerError::BadShape("block"));
    }
    for stmt in &block[1..] {
        let s = as_list(stmt, "stmt")?;
        match s.first().and_then(Node::as_atom) {
            Some("let") if s.len() == 4 => {
                let name = as_atom(&s[1], "let name")?;
                let ty = parse_type(as_atom(&s[2], "let type")?)?;
                out.entry(name.to_owned()).or_insert(ty);
            }
            Some("if") if s.len() >= 3 => {
                collect_locals(as_list(&s[2], "block")?, out)?;
                if s.len() > 3 {
                    let eb = as_list(&s[3], "else")?;
                    if eb.len() == 2 && eb[0].as_atom() == Some("else") {
                        collect_locals(as_list(&eb[1], "block")?, out)?;
                    }
                }
            }
            Some("while") if s.len() == 3 => {
                collect_locals(as_list(&s[2], "block")?, out)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn int_cond(op: &str) -> Cond {
    match op {
        "eq" => Cond::E,
        "ne" => Cond::Ne,
        "lt" => Cond::L,
        "gt" => Cond::G,
        "le" => Cond::Le,
        _ => Cond::Ge,
    }
}

fn float_cond(op: &str) -> Cond {
    match op {
        "eq" => Cond::E,
        "ne" => Cond::Ne,
        "lt" => Cond::B,
        "gt" => Cond::A,
        "le" => Cond::Be,
        _ => Cond::Ae,
    }
}

/// Mnemonic for a float binary op, and whether it is a comparison.
fn float_op(op: &str, ty: Type) -> LResult<(&'static str, bool)> {
    let single = ty == Type::F32;
    let mnem = match op {
        "add" => {
            if single {
                "addss"
            } else {
                "addsd"
            }
        }
        "sub" => {
            if single {
                "subss"
            } else {
                "subsd"
            }
        }
        "mul" => {
            if single {
                "mulss"
            } else {
                "mulsd"
            }
        }
        "div" => {
            if single {
                "divss"
            } else {
                "divsd"
            }
        }
        "eq" | "ne" | "lt" | "gt" | "le" | "ge" => {
            let mnem = if single { "ucomiss" } else { "ucomisd" };
            return Ok((mnem, true));
        }
        _ => return Err(LowerError::UnsupportedOp(op.to_owned())),
    };
    Ok((mnem, false))
}
