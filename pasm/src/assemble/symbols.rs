//! The symbol table: names bound to addresses and constants.
//!
//! Symbols live in an arena for the whole run and are never removed. An entry is
//! created the first time a name is either referenced or defined, and its value is
//! set at most once.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use thiserror::Error;

use crate::{
    assemble::syntax::{BinOp, Expr},
    diagnostics::SourcePos,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Label,
    Constant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    name: String,
    /// Unknown until the symbol is defined.
    kind: Option<SymbolKind>,
    value: Option<i64>,
    defined_at: Option<SourcePos>,
    references: usize,
}

impl Symbol {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Option<SymbolKind> {
        self.kind
    }

    pub fn value(&self) -> Option<i64> {
        self.value
    }

    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    pub fn defined_at(&self) -> Option<SourcePos> {
        self.defined_at
    }

    pub fn references(&self) -> usize {
        self.references
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("symbol `{name}` is already defined at {first}")]
    Duplicate { name: String, first: SourcePos },
    #[error("symbol `{name}` already has the value {old} and cannot become {new}")]
    Redefinition { name: String, old: i64, new: i64 },
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            name: name.to_owned(),
            kind: None,
            value: None,
            defined_at: None,
            references: 0,
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Records the definition site of `name`, creating the entry if needed.
    /// Defining the same name at a second site is an error; the first site wins.
    pub fn define(
        &mut self,
        name: &str,
        kind: SymbolKind,
        pos: SourcePos,
    ) -> Result<SymbolId, SymbolError> {
        let id = self.entry(name);
        let symbol = &mut self.symbols[id.0];
        match symbol.defined_at {
            Some(first) if first != pos => Err(SymbolError::Duplicate {
                name: name.to_owned(),
                first,
            }),
            _ => {
                symbol.defined_at = Some(pos);
                symbol.kind = Some(kind);
                Ok(id)
            }
        }
    }

    /// Notes a use of `name`, creating a provisional entry if needed.
    pub fn reference(&mut self, name: &str) -> SymbolId {
        let id = self.entry(name);
        let symbol = &mut self.symbols[id.0];
        symbol.references += 1;
        id
    }

    /// Sets the value of a symbol. Setting the same value again is allowed.
    pub fn resolve(&mut self, id: SymbolId, value: i64) -> Result<(), SymbolError> {
        let symbol = &mut self.symbols[id.0];
        match symbol.value {
            Some(old) if old != value => Err(SymbolError::Redefinition {
                name: symbol.name.clone(),
                old,
                new: value,
            }),
            _ => {
                symbol.value = Some(value);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|id| &self.symbols[id.0])
    }

    pub fn id(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    /// The finalized value of `name`, if it has one.
    pub fn value(&self, name: &str) -> Option<i64> {
        self.lookup(name).and_then(Symbol::value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Every resolved symbol by name.
    pub fn resolved(&self) -> BTreeMap<String, i64> {
        self.symbols
            .iter()
            .filter_map(|symbol| Some((symbol.name.clone(), symbol.value?)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The named symbols have no value yet.
    Unresolved(Vec<String>),
    Overflow,
    DivisionByZero,
}

impl Expr {
    /// Evaluates with checked 64-bit arithmetic. Every unresolved name is reported
    /// at once rather than stopping at the first.
    pub fn evaluate(&self, symbols: &SymbolTable) -> Result<i64, EvalError> {
        let unresolved = self
            .symbols()
            .into_iter()
            .filter(|name| symbols.value(name).is_none())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if !unresolved.is_empty() {
            return Err(EvalError::Unresolved(unresolved));
        }
        self.compute(symbols)
    }

    fn compute(&self, symbols: &SymbolTable) -> Result<i64, EvalError> {
        match self {
            Expr::Constant(value) => Ok(*value),
            Expr::Symbol(name) => symbols
                .value(name)
                .ok_or_else(|| EvalError::Unresolved(vec![name.clone()])),
            Expr::Neg(inner) => inner
                .compute(symbols)?
                .checked_neg()
                .ok_or(EvalError::Overflow),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.compute(symbols)?;
                let rhs = rhs.compute(symbols)?;
                match op {
                    BinOp::Add => lhs.checked_add(rhs).ok_or(EvalError::Overflow),
                    BinOp::Sub => lhs.checked_sub(rhs).ok_or(EvalError::Overflow),
                    BinOp::Mul => lhs.checked_mul(rhs).ok_or(EvalError::Overflow),
                    BinOp::Div if rhs == 0 => Err(EvalError::DivisionByZero),
                    BinOp::Div => lhs.checked_div(rhs).ok_or(EvalError::Overflow),
                }
            }
        }
    }
}
