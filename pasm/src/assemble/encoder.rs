//! Pass 2: turns placed statements into bytes.

use crate::{
    assemble::{
        AsmError, quoted,
        resolver::{Layout, Placement},
        symbols::{EvalError, SymbolTable},
        syntax::{DataItem, Directive, Expr, Instruction, Operand, Program, Statement, StatementKind},
    },
    diagnostics::{Component, DiagnosticLog, SourcePos},
    isa::{
        Field, InstructionSet, OperandSpec,
        encode::{Fit, word_bytes},
    },
};

/// An encoded program: bytes starting at `base`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub base: i64,
    pub bytes: Vec<u8>,
}

/// Runs pass 2 over a program, using the placements pass 1 recorded in `layout`.
/// Statements pass 1 could not place were already reported and emit nothing.
pub fn encode(
    program: &Program,
    layout: &Layout,
    isa: &InstructionSet,
    symbols: &mut SymbolTable,
    log: &mut DiagnosticLog,
) -> Image {
    let mut bytes = Vec::with_capacity(layout.size());

    for (id, placement) in layout.placed() {
        let statement = program.get(id);
        let pos = statement.pos;
        match &statement.kind {
            StatementKind::Label(name) => relabel(name, pos, placement.address, symbols, log),
            StatementKind::Directive(Directive::Equ { name, value }) => {
                check_equate(name, value, pos, symbols, log);
            }
            _ => {}
        }

        if placement.size == 0 {
            continue;
        }
        let mut encoder = StatementEncoder {
            isa,
            symbols: &*symbols,
            log: &mut *log,
            pos,
            placement,
            reported: Vec::new(),
            failed: false,
        };
        let encoded = encoder.statement(statement);
        match encoded {
            Some(encoded) if !encoder.failed && encoded.len() == placement.size => {
                tracing::trace!(address = placement.address, ?encoded, "encoded statement");
                bytes.extend(encoded);
            }
            _ => bytes.resize(bytes.len() + placement.size, 0),
        }
    }

    for symbol in symbols.iter() {
        if let Some(pos) = symbol.defined_at()
            && symbol.references() == 0
        {
            log.info(
                Component::Encoder,
                pos,
                format!("`{}` is defined but never used", symbol.name()),
            );
        }
    }

    tracing::debug!(base = layout.base, size = bytes.len(), "pass 2 complete");
    Image {
        base: layout.base,
        bytes,
    }
}

/// Re-resolves a label at its pass 2 address. Only the site that defined the label
/// does this; duplicates were already reported.
fn relabel(
    name: &str,
    pos: SourcePos,
    address: i64,
    symbols: &mut SymbolTable,
    log: &mut DiagnosticLog,
) {
    let Some(id) = symbols.id(name) else {
        return;
    };
    if symbols.get(id).defined_at() != Some(pos) {
        return;
    }
    if let Err(err) = symbols.resolve(id, address) {
        log.report(Component::Encoder, pos, err.into());
    }
}

fn check_equate(
    name: &str,
    value: &Expr,
    pos: SourcePos,
    symbols: &SymbolTable,
    log: &mut DiagnosticLog,
) {
    let Some(symbol) = symbols.lookup(name) else {
        return;
    };
    if symbol.defined_at() != Some(pos) || symbol.is_resolved() {
        return;
    }
    let Err(EvalError::Unresolved(names)) = value.evaluate(symbols) else {
        return;
    };
    let (undefined, pending): (Vec<_>, Vec<_>) = names.into_iter().partition(|missing| {
        symbols
            .lookup(missing)
            .is_none_or(|symbol| symbol.defined_at().is_none())
    });
    for name in undefined {
        log.report(Component::Encoder, pos, AsmError::UnresolvedSymbol(name));
    }
    if !pending.is_empty() {
        log.report(
            Component::Encoder,
            pos,
            AsmError::ForwardReference(format!(
                "`{name}` depends on {}, which never resolve",
                quoted(&pending)
            )),
        );
    }
}

struct StatementEncoder<'a> {
    isa: &'a InstructionSet,
    symbols: &'a SymbolTable,
    log: &'a mut DiagnosticLog,
    pos: SourcePos,
    placement: Placement,
    /// Names already reported as unresolved for this statement.
    reported: Vec<String>,
    failed: bool,
}

impl StatementEncoder<'_> {
    fn statement(&mut self, statement: &Statement) -> Option<Vec<u8>> {
        match &statement.kind {
            StatementKind::Instruction(instr) => self.instruction(instr),
            StatementKind::Directive(directive) => Some(self.directive(directive)),
            StatementKind::Label(_) | StatementKind::Error => Some(Vec::new()),
        }
    }

    fn report(&mut self, error: AsmError) {
        self.failed = true;
        self.log.report(Component::Encoder, self.pos, error);
    }

    fn value(&mut self, expr: &Expr) -> Option<i64> {
        match expr.evaluate(self.symbols) {
            Ok(value) => Some(value),
            Err(EvalError::Unresolved(names)) => {
                for name in names {
                    if !self.reported.contains(&name) {
                        self.reported.push(name.clone());
                        self.report(AsmError::UnresolvedSymbol(name));
                    }
                }
                None
            }
            Err(err) => {
                self.report(AsmError::arithmetic(err));
                None
            }
        }
    }

    /// Inserts `value` into `field`, reporting values that do not fit.
    fn field(&mut self, word: u64, field: Field, value: i64, what: &str) -> u64 {
        match field.check(value) {
            Fit::Exact => field.insert(word, value),
            Fit::Wrapped => {
                self.log.warn(
                    Component::Encoder,
                    self.pos,
                    format!(
                        "negative {what} {value} is stored as {:#x}",
                        (value as u64) & field.mask()
                    ),
                );
                field.insert(word, value)
            }
            Fit::Overflow => {
                let (low, high) = field.range();
                self.report(AsmError::EncodingRange(format!(
                    "{what} {value} does not fit in {} bits ({low} to {high})",
                    field.width
                )));
                word
            }
        }
    }

    fn instruction(&mut self, instr: &Instruction) -> Option<Vec<u8>> {
        let form = self
            .isa
            .forms(&instr.mnemonic)
            .and_then(|forms| forms.get(instr.form))?;
        let mut word = form.opcode;

        for (spec, operand) in form.operands.iter().zip(&instr.operands) {
            match (*spec, operand) {
                (OperandSpec::Register { field }, Operand::Register(number)) => {
                    word = self.field(word, field, i64::from(*number), "register");
                }
                (OperandSpec::Immediate { field }, _) => {
                    if let Some(value) = operand.expression().and_then(|e| self.value(&e)) {
                        word = self.field(word, field, value, "immediate");
                    }
                }
                (OperandSpec::Address { field }, _) => {
                    if let Some(value) = operand.expression().and_then(|e| self.value(&e)) {
                        word = self.field(word, field, value, "address");
                    }
                }
                (OperandSpec::Relative { field, bias, scale }, _) => {
                    let Some(target) = operand.expression().and_then(|e| self.value(&e)) else {
                        continue;
                    };
                    let Some(delta) = self
                        .placement
                        .address
                        .checked_add(bias.unwrap_or(i64::from(form.size)))
                        .and_then(|from| target.checked_sub(from))
                    else {
                        self.report(AsmError::arithmetic(EvalError::Overflow));
                        continue;
                    };
                    let scale = i64::from(scale);
                    if delta % scale != 0 {
                        self.report(AsmError::EncodingRange(format!(
                            "branch offset {delta} is not a multiple of {scale}"
                        )));
                        continue;
                    }
                    word = self.field(word, field, delta / scale, "branch offset");
                }
                (
                    OperandSpec::Memory { base, displacement },
                    Operand::Memory {
                        base: register,
                        displacement: offset,
                    },
                ) => {
                    word = self.field(word, base, i64::from(*register), "base register");
                    if let Some(value) = self.value(offset) {
                        word = self.field(word, displacement, value, "displacement");
                    }
                }
                // Form selection guarantees the operand kinds match.
                _ => {}
            }
        }
        Some(word_bytes(word, form.size, self.isa.endian))
    }

    fn directive(&mut self, directive: &Directive) -> Vec<u8> {
        match directive {
            Directive::Origin(_) | Directive::Align(_) => vec![0; self.placement.size],
            Directive::Equ { .. } => Vec::new(),
            Directive::Ascii(bytes) => bytes.clone(),
            Directive::Space { fill, .. } => {
                let fill = fill
                    .as_ref()
                    .and_then(|fill| self.value(fill))
                    .and_then(|fill| self.datum(fill, 1))
                    .and_then(|bytes| bytes.first().copied())
                    .unwrap_or(0);
                vec![fill; self.placement.size]
            }
            Directive::Data { width, items } => {
                let mut bytes = Vec::with_capacity(self.placement.size);
                for item in items {
                    match item {
                        DataItem::Bytes(literal) => bytes.extend(literal),
                        DataItem::Value(expr) => {
                            let encoded = self
                                .value(expr)
                                .and_then(|value| self.datum(value, *width))
                                .unwrap_or_else(|| vec![0; usize::from(*width)]);
                            bytes.extend(encoded);
                        }
                    }
                }
                bytes
            }
        }
    }

    /// Encodes a data value. Negative values are allowed as long as they fit.
    fn datum(&mut self, value: i64, width: u8) -> Option<Vec<u8>> {
        let field = Field {
            shift: 0,
            width: width * 8,
            signed: false,
        };
        if field.check(value) == Fit::Overflow {
            self.report(AsmError::EncodingRange(format!(
                "{value} does not fit in {width} byte{}",
                if width == 1 { "" } else { "s" }
            )));
            return None;
        }
        Some(word_bytes(field.insert(0, value), width, self.isa.endian))
    }
}
