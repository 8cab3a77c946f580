//! The assembler pipeline: lexing, parsing, and the two passes that place and encode
//! each statement.

use std::{collections::BTreeMap, fmt::Display};

use serde::Serialize;
use thiserror::Error;

use crate::{
    diagnostics::{Diagnostic, DiagnosticLog, Policy, Severity},
    isa::{InstructionSet, IsaError},
};

pub mod encoder;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod symbols;
pub mod syntax;

use encoder::Image;
use lexer::LexError;
use symbols::{EvalError, SymbolError, SymbolTable};

/// Everything that can go wrong with a program. Each error is recorded as a
/// [`Diagnostic`] rather than returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("{0}")]
    Lex(#[from] LexError),
    #[error("{0}")]
    Syntax(String),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error("undefined symbol `{0}`")]
    UnresolvedSymbol(String),
    #[error("{0}")]
    EncodingRange(String),
    #[error("{0}")]
    ForwardReference(String),
}

/// The category of an [`AsmError`], as it appears in serialized diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "LexError")]
    Lex,
    #[serde(rename = "SyntaxError")]
    Syntax,
    #[serde(rename = "DuplicateSymbolError")]
    DuplicateSymbol,
    #[serde(rename = "SymbolRedefinitionError")]
    SymbolRedefinition,
    #[serde(rename = "UnresolvedSymbolError")]
    UnresolvedSymbol,
    #[serde(rename = "EncodingRangeError")]
    EncodingRange,
    #[serde(rename = "ForwardReferenceError")]
    ForwardReference,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Lex => write!(f, "LexError"),
            ErrorKind::Syntax => write!(f, "SyntaxError"),
            ErrorKind::DuplicateSymbol => write!(f, "DuplicateSymbolError"),
            ErrorKind::SymbolRedefinition => write!(f, "SymbolRedefinitionError"),
            ErrorKind::UnresolvedSymbol => write!(f, "UnresolvedSymbolError"),
            ErrorKind::EncodingRange => write!(f, "EncodingRangeError"),
            ErrorKind::ForwardReference => write!(f, "ForwardReferenceError"),
        }
    }
}

impl AsmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AsmError::Lex(_) => ErrorKind::Lex,
            AsmError::Syntax(_) => ErrorKind::Syntax,
            AsmError::Symbol(SymbolError::Duplicate { .. }) => ErrorKind::DuplicateSymbol,
            AsmError::Symbol(SymbolError::Redefinition { .. }) => ErrorKind::SymbolRedefinition,
            AsmError::UnresolvedSymbol(_) => ErrorKind::UnresolvedSymbol,
            AsmError::EncodingRange(_) => ErrorKind::EncodingRange,
            AsmError::ForwardReference(_) => ErrorKind::ForwardReference,
        }
    }

    /// Pass 2 is the last chance to resolve a symbol, so an unresolved one
    /// invalidates the output. Everything else is an ordinary error.
    pub fn default_severity(&self) -> Severity {
        match self {
            AsmError::UnresolvedSymbol(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// An expression that evaluated but could not produce a value.
    fn arithmetic(err: EvalError) -> AsmError {
        match err {
            EvalError::Overflow => {
                AsmError::EncodingRange("expression overflows 64 bits".to_owned())
            }
            EvalError::DivisionByZero => AsmError::EncodingRange("division by zero".to_owned()),
            EvalError::Unresolved(names) => AsmError::ForwardReference(format!(
                "{} cannot be resolved here",
                quoted(&names)
            )),
        }
    }
}

/// Formats names as "`a`, `b`".
fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("`{name}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where a run is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Lexing,
    Parsing,
    Pass1,
    Pass2,
    Succeeded,
    Failed,
}

impl Stage {
    fn advance(&mut self, next: Stage) {
        tracing::debug!(from = ?*self, to = ?next, "stage transition");
        *self = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Succeeded,
    Failed,
}

/// The outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssemblyResult {
    pub status: Status,
    /// Address of the first byte.
    pub base: u64,
    /// Empty unless the run succeeded.
    pub bytes: Vec<u8>,
    /// Every symbol that received a value.
    pub symbols: BTreeMap<String, i64>,
    /// Diagnostics at or above the requested threshold, in report order.
    pub diagnostics: Vec<Diagnostic>,
    /// Error and fatal diagnostics recorded, whether shown or not.
    pub errors: usize,
    pub warnings: usize,
}

impl AssemblyResult {
    pub fn succeeded(&self) -> bool {
        self.status == Status::Succeeded
    }
}

/// An assembler for one instruction set. It holds no per-run state, so one value can
/// serve any number of runs, including concurrent ones.
#[derive(Debug, Clone)]
pub struct Assembler {
    isa: InstructionSet,
    policy: Policy,
}

impl Assembler {
    pub fn new(isa: InstructionSet) -> Result<Assembler, IsaError> {
        Ok(Assembler {
            isa: isa.prepare()?,
            policy: Policy::default(),
        })
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn isa(&self) -> &InstructionSet {
        &self.isa
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Assembles `source`, naming it `name` in diagnostics. Only diagnostics at or
    /// above `threshold` are returned, but all of them count towards the status.
    pub fn assemble(&self, name: &str, source: &str, threshold: Severity) -> AssemblyResult {
        let span = tracing::debug_span!("assemble", source = name);
        let _enter = span.enter();

        let mut log = DiagnosticLog::new(name, threshold, self.policy);
        let mut symbols = SymbolTable::new();
        let mut stage = Stage::Idle;

        let image = 'run: {
            stage.advance(Stage::Lexing);
            let lexemes = lexer::tokenize(source, &self.isa, &mut log);
            if log.has_fatal() {
                break 'run None;
            }

            stage.advance(Stage::Parsing);
            let program = parser::parse(&lexemes, &self.isa, &mut log);
            if log.has_fatal() {
                break 'run None;
            }

            stage.advance(Stage::Pass1);
            let layout = resolver::resolve(&program, &self.isa, &mut symbols, &mut log);
            tracing::trace!(size = layout.size(), "layout");
            if log.has_fatal() {
                break 'run None;
            }

            stage.advance(Stage::Pass2);
            Some(encoder::encode(&program, &layout, &self.isa, &mut symbols, &mut log))
        };

        let image = match image {
            Some(image) if !log.has_errors() => {
                stage.advance(Stage::Succeeded);
                image
            }
            image => {
                stage.advance(Stage::Failed);
                Image {
                    base: image.map_or_else(|| self.isa.origin(), |image| image.base),
                    bytes: Vec::new(),
                }
            }
        };
        let status = match stage {
            Stage::Succeeded => Status::Succeeded,
            _ => Status::Failed,
        };

        let result = AssemblyResult {
            status,
            base: u64::try_from(image.base).unwrap_or_default(),
            bytes: image.bytes,
            symbols: symbols.resolved(),
            diagnostics: log.visible(),
            errors: log.count(Severity::Error) + log.count(Severity::Fatal),
            warnings: log.count(Severity::Warning),
        };
        tracing::info!(
            ?status,
            bytes = result.bytes.len(),
            errors = result.errors,
            warnings = result.warnings,
            "assembled {name}"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{diagnostics::SourcePos, isa::OperandSpec};

    fn demo() -> Assembler {
        Assembler::new(InstructionSet::demo().unwrap()).unwrap()
    }

    #[test]
    fn start_and_jump() {
        let result = demo().assemble("start.s", "START: LOADIMM 5\nJUMP START", Severity::Warning);
        assert!(result.succeeded());
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.bytes, vec![0x01, 0x05, 0x02, 0x00, 0x00]);
        assert_eq!(result.symbols.get("START"), Some(&0));
    }

    #[test]
    fn forward_reference_resolves() {
        let result = demo().assemble("f.s", "jump end\nnop\nend: halt", Severity::Info);
        assert!(result.succeeded(), "{:?}", result.diagnostics);
        assert_eq!(result.bytes, vec![0x02, 0x00, 0x05, 0x00, 0x00, 0xFF, 0x00]);
    }

    #[test]
    fn bad_token_fails_with_empty_image() {
        let result = demo().assemble("bad.s", "BADTOKEN $$$", Severity::Info);
        assert_eq!(result.status, Status::Failed);
        assert!(result.bytes.is_empty());
        assert_eq!(result.errors, 1);
        assert_eq!(result.diagnostics[0].severity, Severity::Error);
        assert_eq!(result.diagnostics[0].kind, Some(ErrorKind::Lex));
    }

    #[test]
    fn undefined_symbol() {
        let result = demo().assemble("u.s", "nop\n  jump LOOP\n", Severity::Info);
        assert_eq!(result.status, Status::Failed);
        let unresolved = result
            .diagnostics
            .iter()
            .filter(|d| d.kind == Some(ErrorKind::UnresolvedSymbol))
            .collect::<Vec<_>>();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].pos, SourcePos::new(2, 3));
        assert_eq!(
            unresolved[0].to_string(),
            "u.s:2:3: fatal: undefined symbol `LOOP`"
        );
    }

    #[test]
    fn duplicate_symbol_names_first_site() {
        let result = demo().assemble("d.s", "x: nop\njump x\nx: halt", Severity::Info);
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.diagnostics.len(), 1);
        let diagnostic = &result.diagnostics[0];
        assert_eq!(diagnostic.kind, Some(ErrorKind::DuplicateSymbol));
        assert_eq!(diagnostic.pos, SourcePos::new(3, 1));
        assert!(diagnostic.message.contains("1:1"));
    }

    #[test]
    fn range_error_does_not_hide_later_errors() {
        let result = demo().assemble("r.s", "loadimm 999\njump nowhere", Severity::Info);
        assert_eq!(result.status, Status::Failed);
        let kinds = result
            .diagnostics
            .iter()
            .map(|d| d.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                Some(ErrorKind::EncodingRange),
                Some(ErrorKind::UnresolvedSymbol)
            ]
        );
    }

    #[test]
    fn threshold_hides_but_does_not_change_status() {
        let source = "loadimm -1\nloadimm -2";
        let all = demo().assemble("w.s", source, Severity::Info);
        let fatal_only = demo().assemble("w.s", source, Severity::Fatal);
        assert_eq!(all.diagnostics.len(), 2);
        assert!(fatal_only.diagnostics.is_empty());
        assert!(all.succeeded() && fatal_only.succeeded());
        assert_eq!(all.bytes, fatal_only.bytes);
        assert_eq!(fatal_only.warnings, 2);
    }

    #[test]
    fn policy_escalation() {
        let strict = demo().with_policy(Policy {
            warnings_as_errors: true,
            fatal_range_errors: true,
        });
        let result = strict.assemble("p.s", "loadimm -1", Severity::Info);
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.diagnostics[0].severity, Severity::Error);

        let result = strict.assemble("p.s", "loadimm 999", Severity::Info);
        assert_eq!(result.diagnostics[0].severity, Severity::Fatal);
    }

    #[test]
    fn deterministic() {
        let assembler = demo();
        let source = "a: loadimm b\nbeq a\nb = 3\n.asciz \"hi\"\njump nowhere";
        let first = assembler.assemble("det.s", source, Severity::Info);
        let second = assembler.assemble("det.s", source, Severity::Info);
        assert_eq!(first, second);
    }

    #[test]
    fn parallel_runs_are_independent() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Assembler>();

        let assembler = &demo();
        let sources = (0..8)
            .map(|i| format!("start: loadimm {i}\njump start\nvalue = {i} * 2\n.byte value"))
            .collect::<Vec<_>>();
        let results = std::thread::scope(|scope| {
            let handles = sources
                .iter()
                .map(|source| scope.spawn(move || assembler.assemble("par.s", source, Severity::Info)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });
        for (i, result) in results.iter().enumerate() {
            let i = i as u8;
            assert!(result.succeeded(), "{:?}", result.diagnostics);
            assert_eq!(result.bytes, vec![0x01, i, 0x02, 0x00, 0x00, i * 2]);
            assert_eq!(result.symbols.get("value"), Some(&(i64::from(i) * 2)));
        }
    }

    #[test]
    fn invalid_instruction_set_is_rejected() {
        let mut isa = InstructionSet::demo().unwrap();
        isa.registers.insert("NOP".to_owned(), 1);
        assert!(matches!(Assembler::new(isa), Err(IsaError::NameClash(_))));
    }

    #[test]
    fn branch_origin_overflow_is_a_range_error() {
        let mut isa = InstructionSet::demo().unwrap();
        isa.default_origin = 0x7FFF_FFFF_FFFF_FF00;
        for form in isa.instructions.get_mut("bra").unwrap() {
            for operand in &mut form.operands {
                if let OperandSpec::Relative { bias, .. } = operand {
                    *bias = Some(i64::MAX);
                }
            }
        }
        let result = Assembler::new(isa)
            .unwrap()
            .assemble("b.s", "bra 0", Severity::Info);
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].kind, Some(ErrorKind::EncodingRange));
    }

    #[test]
    fn result_serializes() {
        let result = demo().assemble("s.s", "jump x", Severity::Info);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["diagnostics"][0]["kind"], "UnresolvedSymbolError");
        assert_eq!(json["diagnostics"][0]["severity"], "fatal");
        assert_eq!(json["diagnostics"][0]["component"], "encoder");
    }
}
