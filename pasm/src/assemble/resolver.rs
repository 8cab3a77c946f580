//! Pass 1: assigns an address to every statement and a value to every label.

use crate::{
    assemble::{
        AsmError, quoted,
        symbols::{EvalError, SymbolKind, SymbolTable},
        syntax::{DataItem, Directive, Expr, Operand, Program, Statement, StatementId, StatementKind},
    },
    diagnostics::{Component, DiagnosticLog},
    isa::InstructionSet,
};

/// Largest number of bytes a single statement may reserve.
pub const MAX_RESERVATION: i64 = 1 << 24;

/// Where a statement lands and how many bytes it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub address: i64,
    pub size: usize,
}

/// The pass 1 address counter.
///
/// Sizes depend only on the shape of a statement and on values that must already be
/// known when it is reached.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    pub address: i64,
    /// Address of the first byte of the image.
    pub base: i64,
    /// Whether any byte has been placed yet. Until then an origin moves the base.
    started: bool,
}

impl Cursor {
    pub fn new(isa: &InstructionSet) -> Self {
        let origin = isa.origin();
        Self {
            address: origin,
            base: origin,
            started: false,
        }
    }

    /// Places one statement and advances past it.
    pub fn place(
        &mut self,
        statement: &Statement,
        isa: &InstructionSet,
        symbols: &SymbolTable,
    ) -> Result<Placement, AsmError> {
        let size = match &statement.kind {
            StatementKind::Label(_) | StatementKind::Error => 0,
            StatementKind::Instruction(instr) => isa
                .forms(&instr.mnemonic)
                .and_then(|forms| forms.get(instr.form))
                .map_or(0, |form| i64::from(form.size)),
            StatementKind::Directive(directive) => match directive {
                Directive::Equ { .. } => 0,
                Directive::Data { width, items } => items
                    .iter()
                    .map(|item| match item {
                        DataItem::Value(_) => i64::from(*width),
                        DataItem::Bytes(bytes) => bytes.len() as i64,
                    })
                    .sum::<i64>(),
                Directive::Ascii(bytes) => bytes.len() as i64,
                Directive::Space { count, .. } => {
                    let count = known(count, "the reserved size", symbols)?;
                    if count < 0 {
                        return Err(AsmError::EncodingRange(format!(
                            "cannot reserve a negative number of bytes ({count})"
                        )));
                    }
                    count
                }
                Directive::Align(alignment) => {
                    let alignment = known(alignment, "the alignment", symbols)?;
                    if alignment <= 0 {
                        return Err(AsmError::EncodingRange(format!(
                            "alignment must be positive, not {alignment}"
                        )));
                    }
                    (alignment - self.address.rem_euclid(alignment)) % alignment
                }
                Directive::Origin(target) => {
                    let target = known(target, "the origin", symbols)?;
                    if target < 0 {
                        return Err(AsmError::EncodingRange(format!(
                            "origin {target} is negative"
                        )));
                    }
                    if !self.started {
                        self.address = target;
                        self.base = target;
                        0
                    } else if target < self.address {
                        return Err(AsmError::EncodingRange(format!(
                            "origin {target:#x} is behind the current address {:#x}",
                            self.address
                        )));
                    } else {
                        target - self.address
                    }
                }
            },
        };

        if size > MAX_RESERVATION {
            return Err(AsmError::EncodingRange(format!(
                "statement would occupy {size} bytes, more than the limit of {MAX_RESERVATION}"
            )));
        }
        let placement = Placement {
            address: self.address,
            size: usize::try_from(size).unwrap_or_default(),
        };
        self.address = self.address.checked_add(size).ok_or_else(|| {
            AsmError::EncodingRange("the address counter overflows".to_owned())
        })?;
        if size > 0 {
            self.started = true;
        }
        Ok(placement)
    }
}

/// Evaluates an expression that has to be known as soon as it is reached.
fn known(expr: &Expr, what: &str, symbols: &SymbolTable) -> Result<i64, AsmError> {
    expr.evaluate(symbols).map_err(|err| match err {
        EvalError::Unresolved(names) => AsmError::ForwardReference(format!(
            "{what} uses {}, which must be defined before this line",
            quoted(&names)
        )),
        err => AsmError::arithmetic(err),
    })
}

/// Where pass 1 put every statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pub base: i64,
    pub end: i64,
    /// Indexed by [`StatementId`]. `None` for statements that could not be placed.
    placements: Vec<Option<Placement>>,
}

impl Layout {
    pub fn size(&self) -> usize {
        usize::try_from(self.end - self.base).unwrap_or_default()
    }

    pub fn placement(&self, id: StatementId) -> Option<Placement> {
        self.placements.get(id.0).copied().flatten()
    }

    /// Every placed statement, in source order.
    pub fn placed(&self) -> impl Iterator<Item = (StatementId, Placement)> + '_ {
        self.placements
            .iter()
            .enumerate()
            .filter_map(|(index, placement)| Some((StatementId(index), (*placement)?)))
    }
}

/// Runs pass 1 over a program.
///
/// Every label gets its address. Equates are evaluated as soon as their operands are
/// known; the rest are retried once the whole program has been walked, and whatever
/// is still unresolved after that is left for pass 2 to report.
pub fn resolve(
    program: &Program,
    isa: &InstructionSet,
    symbols: &mut SymbolTable,
    log: &mut DiagnosticLog,
) -> Layout {
    let mut cursor = Cursor::new(isa);
    let mut deferred = Vec::new();
    let mut placements = Vec::with_capacity(program.len());

    for (_, statement) in program.iter() {
        let pos = statement.pos;
        note_references(statement, symbols);

        match &statement.kind {
            StatementKind::Label(name) => {
                match symbols.define(name, SymbolKind::Label, pos) {
                    Ok(id) => {
                        if let Err(err) = symbols.resolve(id, cursor.address) {
                            log.report(Component::Resolver, pos, err.into());
                        }
                    }
                    Err(err) => log.report(Component::Resolver, pos, err.into()),
                }
            }
            StatementKind::Directive(Directive::Equ { name, value }) => {
                match symbols.define(name, SymbolKind::Constant, pos) {
                    Ok(id) => match value.evaluate(symbols) {
                        Ok(v) => {
                            if let Err(err) = symbols.resolve(id, v) {
                                log.report(Component::Resolver, pos, err.into());
                            }
                        }
                        Err(EvalError::Unresolved(names)) => {
                            tracing::trace!(%name, ?names, "deferring equate");
                            deferred.push((id, value, pos));
                        }
                        Err(err) => {
                            log.report(Component::Resolver, pos, AsmError::arithmetic(err))
                        }
                    },
                    Err(err) => log.report(Component::Resolver, pos, err.into()),
                }
            }
            _ => {}
        }

        match cursor.place(statement, isa, symbols) {
            Ok(placement) => placements.push(Some(placement)),
            Err(err) => {
                log.report(Component::Resolver, pos, err);
                placements.push(None);
            }
        }
    }

    // Each round resolves at least one equate or stops.
    loop {
        let before = deferred.len();
        deferred.retain(|&(id, value, pos)| match value.evaluate(symbols) {
            Ok(v) => {
                if let Err(err) = symbols.resolve(id, v) {
                    log.report(Component::Resolver, pos, err.into());
                }
                false
            }
            Err(EvalError::Unresolved(_)) => true,
            Err(err) => {
                log.report(Component::Resolver, pos, AsmError::arithmetic(err));
                false
            }
        });
        if deferred.len() == before {
            break;
        }
    }

    let layout = Layout {
        base: cursor.base,
        end: cursor.address,
        placements,
    };
    tracing::debug!(
        base = layout.base,
        end = layout.end,
        symbols = symbols.len(),
        unresolved_equates = deferred.len(),
        "pass 1 complete"
    );
    layout
}

fn note_references(statement: &Statement, symbols: &mut SymbolTable) {
    let mut expressions = Vec::new();
    match &statement.kind {
        StatementKind::Label(_) | StatementKind::Error => {}
        StatementKind::Instruction(instr) => {
            expressions.extend(instr.operands.iter().filter_map(Operand::expression));
        }
        StatementKind::Directive(directive) => match directive {
            Directive::Origin(expr) | Directive::Align(expr) => expressions.push(expr.clone()),
            Directive::Equ { value, .. } => expressions.push(value.clone()),
            Directive::Space { count, fill } => {
                expressions.push(count.clone());
                expressions.extend(fill.clone());
            }
            Directive::Data { items, .. } => {
                expressions.extend(items.iter().filter_map(|item| match item {
                    DataItem::Value(expr) => Some(expr.clone()),
                    DataItem::Bytes(_) => None,
                }));
            }
            Directive::Ascii(_) => {}
        },
    }
    for expr in &expressions {
        for name in expr.symbols() {
            symbols.reference(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assemble::{ErrorKind, lexer::tokenize, parser::parse},
        diagnostics::{Policy, Severity, SourcePos},
    };

    fn pass1(src: &str) -> (Layout, SymbolTable, DiagnosticLog) {
        let isa = InstructionSet::demo().unwrap();
        let mut log = DiagnosticLog::new("t.s", Severity::Info, Policy::default());
        let lexemes = tokenize(src, &isa, &mut log);
        let program = parse(&lexemes, &isa, &mut log);
        let mut symbols = SymbolTable::new();
        let layout = resolve(&program, &isa, &mut symbols, &mut log);
        (layout, symbols, log)
    }

    #[test]
    fn labels_take_the_current_address() {
        let (layout, symbols, log) =
            pass1("start: loadimm 5\nnext: jump later\n.byte 1, 2, \"abc\"\nlater: nop");
        assert!(log.is_empty(), "{:?}", log.all());
        assert_eq!(symbols.value("start"), Some(0));
        assert_eq!(symbols.value("next"), Some(2));
        assert_eq!(symbols.value("later"), Some(10));
        assert_eq!((layout.base, layout.end), (0, 12));
    }

    #[test]
    fn unresolved_operands_do_not_change_sizes() {
        let (layout, symbols, _) = pass1("jump nowhere\nhere: nop");
        assert_eq!(symbols.value("here"), Some(3));
        assert_eq!(layout.size(), 5);
        assert!(!symbols.lookup("nowhere").unwrap().is_resolved());
    }

    #[test]
    fn origin_rebases_then_pads() {
        let (layout, symbols, log) = pass1(".org 0x100\na: nop\n.org 0x108\nb: nop");
        assert!(log.is_empty());
        assert_eq!(symbols.value("a"), Some(0x100));
        assert_eq!(symbols.value("b"), Some(0x108));
        assert_eq!((layout.base, layout.end), (0x100, 0x10A));

        let (_, _, log) = pass1("nop\n.org 0\nnop");
        assert_eq!(log.all()[0].kind, Some(ErrorKind::EncodingRange));
        assert_eq!(log.all()[0].pos, SourcePos::new(2, 1));
    }

    #[test]
    fn align_and_space() {
        let (_, symbols, log) = pass1(".byte 1\n.align 4\na: .space 3, 0xFF\nb: .align 1\nc:");
        assert!(log.is_empty());
        assert_eq!(symbols.value("a"), Some(4));
        assert_eq!(symbols.value("b"), Some(7));
        assert_eq!(symbols.value("c"), Some(7));

        let (_, _, log) = pass1(".align 0");
        assert_eq!(log.all()[0].kind, Some(ErrorKind::EncodingRange));
    }

    #[test]
    fn sizing_arguments_must_be_known() {
        let (layout, _, log) = pass1(".space n\nn = 4");
        assert_eq!(layout.size(), 0);
        assert_eq!(log.len(), 1);
        assert_eq!(log.all()[0].kind, Some(ErrorKind::ForwardReference));
        assert!(log.all()[0].message.contains("`n`"));
        assert_eq!(layout.placement(StatementId(0)), None);
    }

    #[test]
    fn placements_follow_statements() {
        let (layout, _, _) = pass1("a: loadimm 5\n.space n\njump a\nn = 2");
        assert_eq!(
            layout.placed().collect::<Vec<_>>(),
            vec![
                (StatementId(0), Placement { address: 0, size: 0 }),
                (StatementId(1), Placement { address: 0, size: 2 }),
                (StatementId(3), Placement { address: 2, size: 3 }),
                (StatementId(4), Placement { address: 5, size: 0 }),
            ]
        );
    }

    #[test]
    fn forward_equates_settle() {
        let (_, symbols, log) = pass1("a = b + 1\nb = c * 2\nc = end\nnop\nend:");
        assert!(log.is_empty());
        assert_eq!(symbols.value("c"), Some(2));
        assert_eq!(symbols.value("b"), Some(4));
        assert_eq!(symbols.value("a"), Some(5));
    }

    #[test]
    fn cyclic_equates_stay_unresolved() {
        let (_, symbols, log) = pass1("a = b\nb = a");
        assert!(log.is_empty());
        assert_eq!(symbols.value("a"), None);
        assert_eq!(symbols.value("b"), None);
    }

    #[test]
    fn duplicate_label_keeps_first_address() {
        let (_, symbols, log) = pass1("x: nop\nx: nop");
        assert_eq!(symbols.value("x"), Some(0));
        assert_eq!(log.len(), 1);
        assert_eq!(log.all()[0].kind, Some(ErrorKind::DuplicateSymbol));
        assert_eq!(log.all()[0].pos, SourcePos::new(2, 1));
        assert!(log.all()[0].message.contains("1:1"));
    }

    #[test]
    fn references_are_counted() {
        let (_, symbols, _) = pass1("loop: bra loop\njump loop\nunused: nop");
        assert_eq!(symbols.lookup("loop").unwrap().references(), 2);
        assert_eq!(symbols.lookup("unused").unwrap().references(), 0);
    }
}
