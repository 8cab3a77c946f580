//! A line-oriented parser for assembly source.
//!
//! Each line is parsed on its own, so a malformed line costs one diagnostic and one
//! error statement while the rest of the file is still read.

use chumsky::{
    input::{Stream, ValueInput},
    prelude::*,
};

use crate::{
    assemble::{
        AsmError,
        lexer::{Lexeme, Token},
        syntax::{
            BinOp, DataItem, Directive, Expr, Instruction, Operand, Program, StatementKind,
        },
    },
    diagnostics::{Component, DiagnosticLog, SourcePos},
    isa::{DirectiveKind, InstructionForm, InstructionSet, OperandSpec},
};

/// Parses every line of a token stream into statements.
pub fn parse(lexemes: &[Lexeme<'_>], isa: &InstructionSet, log: &mut DiagnosticLog) -> Program {
    let mut program = Program::default();
    for line in lexemes.split(|lexeme| matches!(lexeme.token, Token::Newline | Token::Eof)) {
        let Some(first) = line.first() else {
            continue;
        };
        // The lexer has already reported this line.
        if line.iter().any(|lexeme| matches!(lexeme.token, Token::Error(_))) {
            program.push(first.pos, StatementKind::Error);
            continue;
        }
        parse_line(line, isa, &mut program, log);
    }
    tracing::trace!(statements = program.len(), "parsed program");
    program
}

fn parse_line(
    line: &[Lexeme<'_>],
    isa: &InstructionSet,
    program: &mut Program,
    log: &mut DiagnosticLog,
) {
    let end = line.last().map_or(0, |lexeme| lexeme.span.end);
    let tokens = line
        .iter()
        .map(|lexeme| (lexeme.token.clone(), SimpleSpan::from(lexeme.span.clone())));
    let token_stream =
        Stream::from_iter(tokens).map((end..end).into(), |(t, s): (_, _)| (t, s));

    let parsed = match line_parser().parse(token_stream).into_result() {
        Ok(parsed) => parsed,
        Err(errs) => {
            let (pos, message) = errs.first().map_or_else(
                || (line[0].pos, "invalid statement".to_owned()),
                |err| (position_at(line, err.span().start), err.to_string()),
            );
            log.report(Component::Parser, pos, AsmError::Syntax(message));
            program.push(line[0].pos, StatementKind::Error);
            return;
        }
    };

    if let Some((name, span)) = parsed.label {
        program.push(
            position_at(line, span.start),
            StatementKind::Label(name.to_owned()),
        );
    }
    if let Some((body, span)) = parsed.body {
        let pos = position_at(line, span.start);
        match lower(body, isa) {
            Ok(kind) => {
                program.push(pos, kind);
            }
            Err(message) => {
                log.report(Component::Parser, pos, AsmError::Syntax(message));
                program.push(pos, StatementKind::Error);
            }
        }
    }
}

/// The position of the token starting at or after `offset`, or just past the end of
/// the line.
fn position_at(line: &[Lexeme<'_>], offset: usize) -> SourcePos {
    if let Some(lexeme) = line.iter().find(|lexeme| lexeme.span.start >= offset) {
        return lexeme.pos;
    }
    match line.last() {
        Some(last) => SourcePos::new(
            last.pos.line,
            last.pos.column + last.text.chars().count(),
        ),
        None => SourcePos::new(1, 1),
    }
}

#[derive(Debug)]
struct Line<'src> {
    label: Option<(&'src str, SimpleSpan)>,
    body: Option<(Body<'src>, SimpleSpan)>,
}

#[derive(Debug)]
enum Body<'src> {
    Instruction {
        mnemonic: &'src str,
        operands: Vec<Operand>,
    },
    Directive {
        name: &'src str,
        args: Vec<Argument>,
    },
    /// `name = expr`
    Assign { name: &'src str, value: Expr },
}

#[derive(Debug, Clone)]
enum Argument {
    Expr(Expr),
    Str(String),
}

fn line_parser<'tokens, 'src: 'tokens, I>()
-> impl Parser<'tokens, I, Line<'src>, extra::Err<Rich<'tokens, Token<'src>>>>
where
    I: ValueInput<'tokens, Token = Token<'src>, Span = SimpleSpan>,
{
    let name = select! { Token::Name(name) => name };
    let label = name
        .clone()
        .map_with(|name, e| (name, e.span()))
        .then_ignore(just(Token::Colon));

    let operands = operand()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>();
    let argument = choice((
        select! { Token::Str(s) => Argument::Str(s) },
        expression().map(Argument::Expr),
    ));
    let arguments = argument
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>();

    let body = choice((
        select! { Token::Mnemonic(mnemonic) => mnemonic }
            .then(operands)
            .map(|(mnemonic, operands)| Body::Instruction { mnemonic, operands }),
        select! { Token::Directive(name) => name }
            .then(arguments)
            .map(|(name, args)| Body::Directive { name, args }),
        name.then_ignore(just(Token::Equals))
            .then(expression())
            .map(|(name, value)| Body::Assign { name, value }),
    ))
    .map_with(|body, e| (body, e.span()));

    label
        .or_not()
        .then(body.or_not())
        .then_ignore(end())
        .map(|(label, body)| Line { label, body })
}

fn operand<'tokens, 'src: 'tokens, I>()
-> impl Parser<'tokens, I, Operand, extra::Err<Rich<'tokens, Token<'src>>>> + Clone
where
    I: ValueInput<'tokens, Token = Token<'src>, Span = SimpleSpan>,
{
    let register = select! { Token::Register(number) => number };
    // A leading minus is left in place so that `[r1 - 4 - 2]` means `r1 + (-4 - 2)`.
    let displacement = choice((
        just(Token::Plus).ignore_then(expression()),
        just(Token::Minus).rewind().ignore_then(expression()),
    ));
    let memory = register
        .clone()
        .then(displacement.or_not())
        .delimited_by(just(Token::LBracket), just(Token::RBracket))
        .map(|(base, displacement)| Operand::Memory {
            base,
            displacement: displacement.unwrap_or(Expr::Constant(0)),
        });

    choice((
        register.map(Operand::Register),
        just(Token::Hash)
            .ignore_then(expression())
            .map(Operand::Immediate),
        memory,
        expression().map(|expr| match expr {
            Expr::Symbol(name) => Operand::Symbol(name),
            expr => Operand::Immediate(expr),
        }),
    ))
}

fn expression<'tokens, 'src: 'tokens, I>()
-> impl Parser<'tokens, I, Expr, extra::Err<Rich<'tokens, Token<'src>>>> + Clone
where
    I: ValueInput<'tokens, Token = Token<'src>, Span = SimpleSpan>,
{
    recursive(|expr| {
        let atom = choice((
            select! { Token::Integer(value) => Expr::Constant(value) },
            select! { Token::Name(name) => Expr::Symbol(name.to_owned()) },
            expr.delimited_by(just(Token::LParen), just(Token::RParen)),
        ));
        let unary = just(Token::Minus)
            .repeated()
            .foldr(atom, |_, operand| Expr::Neg(Box::new(operand)));
        let product = unary.clone().foldl(
            choice((
                just(Token::Star).to(BinOp::Mul),
                just(Token::Slash).to(BinOp::Div),
            ))
            .then(unary)
            .repeated(),
            |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
        );
        product.clone().foldl(
            choice((
                just(Token::Plus).to(BinOp::Add),
                just(Token::Minus).to(BinOp::Sub),
            ))
            .then(product)
            .repeated(),
            |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
        )
    })
}

/// Checks a parsed line body against the instruction set.
fn lower(body: Body<'_>, isa: &InstructionSet) -> Result<StatementKind, String> {
    match body {
        Body::Instruction { mnemonic, operands } => {
            let forms = isa
                .forms(mnemonic)
                .ok_or_else(|| format!("unknown mnemonic `{mnemonic}`"))?;
            let form = forms
                .iter()
                .position(|form| form_accepts(form, &operands))
                .ok_or_else(|| {
                    format!(
                        "`{mnemonic}` cannot take {}; expected {}",
                        describe_operands(&operands),
                        forms
                            .iter()
                            .map(|form| describe_form(mnemonic, form))
                            .collect::<Vec<_>>()
                            .join(" or ")
                    )
                })?;
            Ok(StatementKind::Instruction(Instruction {
                mnemonic: mnemonic.to_lowercase(),
                form,
                operands,
            }))
        }
        Body::Directive { name, args } => {
            let kind = isa
                .directive(name)
                .ok_or_else(|| format!("unknown directive `{name}`"))?;
            lower_directive(name, kind, args).map(StatementKind::Directive)
        }
        Body::Assign { name, value } => Ok(StatementKind::Directive(Directive::Equ {
            name: name.to_owned(),
            value,
        })),
    }
}

fn lower_directive(
    name: &str,
    kind: DirectiveKind,
    args: Vec<Argument>,
) -> Result<Directive, String> {
    let expressions = |args: Vec<Argument>| -> Result<Vec<Expr>, String> {
        args.into_iter()
            .map(|arg| match arg {
                Argument::Expr(expr) => Ok(expr),
                Argument::Str(_) => Err(format!("`{name}` does not accept strings")),
            })
            .collect()
    };

    match kind {
        DirectiveKind::Origin => match <[Expr; 1]>::try_from(expressions(args)?) {
            Ok([address]) => Ok(Directive::Origin(address)),
            Err(_) => Err(format!("syntax: {name} <address>")),
        },
        DirectiveKind::Align => match <[Expr; 1]>::try_from(expressions(args)?) {
            Ok([alignment]) => Ok(Directive::Align(alignment)),
            Err(_) => Err(format!("syntax: {name} <alignment>")),
        },
        DirectiveKind::Space => {
            let mut args = expressions(args)?.into_iter();
            match (args.next(), args.next(), args.next()) {
                (Some(count), fill, None) => Ok(Directive::Space { count, fill }),
                _ => Err(format!("syntax: {name} <count>[, <fill>]")),
            }
        }
        DirectiveKind::Equ => match <[Expr; 2]>::try_from(expressions(args)?) {
            Ok([Expr::Symbol(symbol), value]) => Ok(Directive::Equ {
                name: symbol,
                value,
            }),
            _ => Err(format!("syntax: {name} <name>, <value>")),
        },
        DirectiveKind::Data { width } => {
            if args.is_empty() {
                return Err(format!("`{name}` needs at least one value"));
            }
            let items = args
                .into_iter()
                .map(|arg| match arg {
                    Argument::Expr(expr) => Ok(DataItem::Value(expr)),
                    Argument::Str(s) if width == 1 => Ok(DataItem::Bytes(s.into_bytes())),
                    Argument::Str(_) => Err(format!(
                        "`{name}` emits {width}-byte values and does not accept strings"
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Directive::Data { width, items })
        }
        DirectiveKind::Ascii | DirectiveKind::Asciz => {
            if args.is_empty() {
                return Err(format!("`{name}` needs at least one string"));
            }
            let mut bytes = Vec::new();
            for arg in args {
                let Argument::Str(s) = arg else {
                    return Err(format!("`{name}` only accepts strings"));
                };
                bytes.extend(s.into_bytes());
                if kind == DirectiveKind::Asciz {
                    bytes.push(0);
                }
            }
            Ok(Directive::Ascii(bytes))
        }
    }
}

fn form_accepts(form: &InstructionForm, operands: &[Operand]) -> bool {
    form.operands.len() == operands.len()
        && form
            .operands
            .iter()
            .zip(operands)
            .all(|(spec, operand)| spec_accepts(spec, operand))
}

fn spec_accepts(spec: &OperandSpec, operand: &Operand) -> bool {
    matches!(
        (spec, operand),
        (OperandSpec::Register { .. }, Operand::Register(_))
            | (
                OperandSpec::Immediate { .. }
                    | OperandSpec::Address { .. }
                    | OperandSpec::Relative { .. },
                Operand::Immediate(_) | Operand::Symbol(_),
            )
            | (OperandSpec::Memory { .. }, Operand::Memory { .. })
    )
}

fn describe_form(mnemonic: &str, form: &InstructionForm) -> String {
    let operands = form
        .operands
        .iter()
        .map(|spec| match spec {
            OperandSpec::Register { .. } => "<register>",
            OperandSpec::Immediate { .. } => "<immediate>",
            OperandSpec::Address { .. } => "<address>",
            OperandSpec::Relative { .. } => "<target>",
            OperandSpec::Memory { .. } => "[<register> + <offset>]",
        })
        .collect::<Vec<_>>()
        .join(", ");
    if operands.is_empty() {
        format!("`{mnemonic}`")
    } else {
        format!("`{mnemonic} {operands}`")
    }
}

fn describe_operands(operands: &[Operand]) -> String {
    if operands.is_empty() {
        return "no operands".to_owned();
    }
    let kinds = operands
        .iter()
        .map(|operand| match operand {
            Operand::Register(_) => "register",
            Operand::Immediate(_) => "immediate",
            Operand::Symbol(_) => "symbol",
            Operand::Memory { .. } => "memory",
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("({kinds})")
}
