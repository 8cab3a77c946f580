//! Abstract syntax for assembly programs.

use crate::diagnostics::SourcePos;

/// Handle to a statement in a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatementId(pub usize);

/// The parsed statements of one source file, in source order.
#[derive(Debug, Default)]
pub struct Program {
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn push(&mut self, pos: SourcePos, kind: StatementKind) -> StatementId {
        self.statements.push(Statement { pos, kind });
        StatementId(self.statements.len() - 1)
    }

    pub fn get(&self, id: StatementId) -> &Statement {
        &self.statements[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (StatementId, &Statement)> {
        self.statements
            .iter()
            .enumerate()
            .map(|(index, statement)| (StatementId(index), statement))
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub pos: SourcePos,
    pub kind: StatementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Label(String),
    Instruction(Instruction),
    Directive(Directive),
    /// Stands in for a line that failed to lex or parse. Encodes to nothing.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The mnemonic in lowercase.
    pub mnemonic: String,
    /// Index of the selected form in the instruction set's list for this mnemonic.
    pub form: usize,
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Register(u8),
    /// `#expr`, or any expression that is more than a bare name.
    Immediate(Expr),
    /// A bare name.
    Symbol(String),
    /// `[base]` or `[base +/- displacement]`.
    Memory { base: u8, displacement: Expr },
}

impl Operand {
    /// The expression this operand evaluates, if any.
    pub fn expression(&self) -> Option<Expr> {
        match self {
            Operand::Register(_) => None,
            Operand::Immediate(expr) => Some(expr.clone()),
            Operand::Symbol(name) => Some(Expr::Symbol(name.clone())),
            Operand::Memory { displacement, .. } => Some(displacement.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Origin(Expr),
    Data { width: u8, items: Vec<DataItem> },
    /// String bytes, already including any terminators.
    Ascii(Vec<u8>),
    Space { count: Expr, fill: Option<Expr> },
    Align(Expr),
    Equ { name: String, value: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataItem {
    Value(Expr),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(i64),
    Symbol(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Every symbol named in this expression, in order of appearance, without repeats.
    pub fn symbols(&self) -> Vec<&str> {
        fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
            match expr {
                Expr::Constant(_) => {}
                Expr::Symbol(name) => {
                    if !out.contains(&name.as_str()) {
                        out.push(name);
                    }
                }
                Expr::Neg(inner) => walk(inner, out),
                Expr::Binary(_, lhs, rhs) => {
                    walk(lhs, out);
                    walk(rhs, out);
                }
            }
        }

        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }
}
