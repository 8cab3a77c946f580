//! Splits assembly source into tokens.

use std::{fmt::Display, ops::Range};

use logos::Logos;
use thiserror::Error;

use crate::{
    assemble::AsmError,
    diagnostics::{Component, DiagnosticLog, SourcePos},
    isa::{InstructionSet, Keyword},
};

#[derive(Default, Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("malformed number `{0}`")]
    MalformedNumber(String),
    #[error("number `{0}` does not fit in 64 bits")]
    NumberOverflow(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid escape sequence in \"{0}\"")]
    InvalidEscape(String),
    #[error("character literal {0} must contain exactly one character")]
    InvalidCharLiteral(String),
    #[default]
    #[error("unrecognised input")]
    Other,
}

impl LexError {
    fn from_lexer<'a>(lex: &mut logos::Lexer<'a, Token<'a>>) -> Self {
        match lex.slice().chars().next() {
            Some(c) => LexError::InvalidCharacter(c),
            None => LexError::Other,
        }
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error(LexError, LexError::from_lexer))]
pub enum Token<'a> {
    /// Stands in for input that could not be lexed.
    Error(LexError),

    #[regex(r"[A-Za-z_.][A-Za-z0-9_.]*")]
    Name(&'a str),

    Mnemonic(&'a str),
    Directive(&'a str),
    Register(u8),

    #[regex(r"[0-9][0-9A-Za-z_]*", lex_integer)]
    #[regex(r"'([^'\\\n]|\\[^\n])*'", lex_char)]
    Integer(i64),

    #[token("\"", lex_string)]
    Str(String),

    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("#")]
    Hash,
    #[token("=")]
    Equals,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    #[regex(r"[ \t\f\r]+")]
    Whitespace,

    #[token("\n")]
    Newline,

    #[regex(r";[^\n]*", allow_greedy = true)]
    Comment(&'a str),

    Eof,
}

impl<'a> Token<'a> {
    /// Reclassifies names that the instruction set reserves.
    fn disambiguate(self, isa: &InstructionSet) -> Token<'a> {
        match self {
            Token::Name(name) => match isa.classify(name) {
                Some(Keyword::Register(number)) => Token::Register(number),
                Some(Keyword::Mnemonic) => Token::Mnemonic(name),
                Some(Keyword::Directive) => Token::Directive(name),
                None => self,
            },
            _ => self,
        }
    }
}

impl<'a> Display for Token<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Error(err) => write!(f, "{err}"),
            Token::Name(name) => write!(f, "`{name}`"),
            Token::Mnemonic(name) => write!(f, "mnemonic `{name}`"),
            Token::Directive(name) => write!(f, "directive `{name}`"),
            Token::Register(number) => write!(f, "register {number}"),
            Token::Integer(value) => write!(f, "{value}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Colon => write!(f, "`:`"),
            Token::Comma => write!(f, "`,`"),
            Token::Hash => write!(f, "`#`"),
            Token::Equals => write!(f, "`=`"),
            Token::Plus => write!(f, "`+`"),
            Token::Minus => write!(f, "`-`"),
            Token::Star => write!(f, "`*`"),
            Token::Slash => write!(f, "`/`"),
            Token::LParen => write!(f, "`(`"),
            Token::RParen => write!(f, "`)`"),
            Token::LBracket => write!(f, "`[`"),
            Token::RBracket => write!(f, "`]`"),
            Token::Whitespace => write!(f, "whitespace"),
            Token::Newline => write!(f, "end of line"),
            Token::Comment(_) => write!(f, "comment"),
            Token::Eof => write!(f, "end of file"),
        }
    }
}

fn lex_integer<'a>(lex: &mut logos::Lexer<'a, Token<'a>>) -> Result<i64, LexError> {
    parse_integer(lex.slice())
}

/// Parses decimal, `0x`, `0b` and `0o` literals with optional `_` separators.
/// Values up to `u64::MAX` are accepted and reinterpreted as two's complement.
pub fn parse_integer(text: &str) -> Result<i64, LexError> {
    let digits = text.replace('_', "");
    let (radix, body) = match digits.get(..2) {
        Some("0x" | "0X") => (16, &digits[2..]),
        Some("0b" | "0B") => (2, &digits[2..]),
        Some("0o" | "0O") => (8, &digits[2..]),
        _ => (10, digits.as_str()),
    };
    if body.is_empty() {
        return Err(LexError::MalformedNumber(text.to_owned()));
    }
    u64::from_str_radix(body, radix)
        .map(|value| value as i64)
        .map_err(|err| match err.kind() {
            std::num::IntErrorKind::PosOverflow => LexError::NumberOverflow(text.to_owned()),
            _ => LexError::MalformedNumber(text.to_owned()),
        })
}

fn lex_char<'a>(lex: &mut logos::Lexer<'a, Token<'a>>) -> Result<i64, LexError> {
    let slice = lex.slice();
    let body = &slice[1..slice.len() - 1];
    let text =
        unescape::unescape(body).ok_or_else(|| LexError::InvalidEscape(body.to_owned()))?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(i64::from(u32::from(c))),
        _ => Err(LexError::InvalidCharLiteral(slice.to_owned())),
    }
}

/// Called after an opening quote. Consumes up to the closing quote, or to the end
/// of the line if there is none.
fn lex_string<'a>(lex: &mut logos::Lexer<'a, Token<'a>>) -> Result<String, LexError> {
    let rest = lex.remainder();
    let mut escaped = false;
    for (index, c) in rest.char_indices() {
        match c {
            '\n' => break,
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            '"' if !escaped => {
                lex.bump(index + 1);
                let body = &rest[..index];
                return unescape::unescape(body)
                    .ok_or_else(|| LexError::InvalidEscape(body.to_owned()));
            }
            _ => {}
        }
        escaped = false;
    }
    lex.bump(rest.find('\n').unwrap_or(rest.len()));
    Err(LexError::UnterminatedString)
}

/// Maps byte offsets to 1-based line and column numbers.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    src: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(src: &'a str) -> Self {
        let starts = std::iter::once(0)
            .chain(src.match_indices('\n').map(|(index, _)| index + 1))
            .collect();
        Self { src, starts }
    }

    pub fn position(&self, offset: usize) -> SourcePos {
        let line = self.starts.partition_point(|&start| start <= offset).max(1);
        let start = self.starts[line - 1];
        let column = self
            .src
            .get(start..offset)
            .map_or(offset.saturating_sub(start), |text| text.chars().count())
            + 1;
        SourcePos::new(line, column)
    }
}

/// A token together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme<'a> {
    pub token: Token<'a>,
    pub text: &'a str,
    pub span: Range<usize>,
    pub pos: SourcePos,
}

/// A lazy token stream ending in exactly one [`Token::Eof`].
///
/// Whitespace and comments are dropped. After a lexical error the rest of the line
/// is skipped, so each bad line yields a single [`Token::Error`].
pub struct Lexer<'src, 'isa> {
    src: &'src str,
    isa: &'isa InstructionSet,
    lines: LineIndex<'src>,
    inner: logos::Lexer<'src, Token<'src>>,
    skipping_line: bool,
    finished: bool,
}

impl<'src, 'isa> Lexer<'src, 'isa> {
    pub fn new(src: &'src str, isa: &'isa InstructionSet) -> Self {
        Self {
            src,
            isa,
            lines: LineIndex::new(src),
            inner: Token::lexer(src),
            skipping_line: false,
            finished: false,
        }
    }

    /// Rewinds to the start of the source.
    pub fn restart(&mut self) {
        self.inner = Token::lexer(self.src);
        self.skipping_line = false;
        self.finished = false;
    }

    fn lexeme(&self, token: Token<'src>, span: Range<usize>) -> Lexeme<'src> {
        Lexeme {
            token,
            text: &self.src[span.clone()],
            pos: self.lines.position(span.start),
            span,
        }
    }
}

impl<'src, 'isa> Iterator for Lexer<'src, 'isa> {
    type Item = Lexeme<'src>;

    fn next(&mut self) -> Option<Lexeme<'src>> {
        loop {
            let Some(result) = self.inner.next() else {
                if self.finished {
                    return None;
                }
                self.finished = true;
                let end = self.src.len();
                return Some(self.lexeme(Token::Eof, end..end));
            };
            let span = self.inner.span();
            let token = match result {
                Ok(Token::Whitespace | Token::Comment(_)) => continue,
                Ok(Token::Newline) => {
                    self.skipping_line = false;
                    Token::Newline
                }
                _ if self.skipping_line => continue,
                Ok(token) => token.disambiguate(self.isa),
                Err(err) => {
                    self.skipping_line = true;
                    Token::Error(err)
                }
            };
            return Some(self.lexeme(token, span));
        }
    }
}

/// Lexes the whole source, recording every lexical error in `log`.
pub fn tokenize<'src>(
    src: &'src str,
    isa: &InstructionSet,
    log: &mut DiagnosticLog,
) -> Vec<Lexeme<'src>> {
    Lexer::new(src, isa)
        .inspect(|lexeme| {
            if let Token::Error(err) = &lexeme.token {
                log.report(Component::Lexer, lexeme.pos, AsmError::Lex(err.clone()));
            }
        })
        .collect()
}
