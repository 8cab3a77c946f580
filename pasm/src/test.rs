//! Runs the `.s` fixtures in `test/` against the demo instruction set.
//!
//! Expectations are written as `;!` comments anywhere in the fixture:
//!
//! - `;! BYTES 01 05 ...` the expected image (repeat to continue; empty for no bytes)
//! - `;! STATUS succeeded|failed`
//! - `;! ERROR <line>:<column> <kind>` one per error or fatal diagnostic, in order
//! - `;! WARNINGS <count>`
//! - `;! SYMBOL <name> <value>`
//! - `;! BASE <address>`

use std::collections::BTreeMap;

use crate::{
    assemble::{Assembler, Status, lexer::parse_integer},
    diagnostics::Severity,
    isa::{InstructionSet, IsaError},
};

#[derive(Debug)]
pub enum TestError {
    FileError(String),
    Isa(IsaError),
    InvalidComment(String),
    InvalidParams(&'static str, String),
}

mod fixtures {
    include!(concat!(env!("OUT_DIR"), "/tests.rs"));
}

pub fn test(name: &str, src: &str) -> Result<(), TestError> {
    let isa = InstructionSet::demo().map_err(TestError::Isa)?;
    let assembler = Assembler::new(isa).map_err(TestError::Isa)?;
    let result = assembler.assemble(name, src, Severity::Info);
    for diagnostic in &result.diagnostics {
        println!("{diagnostic}");
    }
    println!("{:02X?}", result.bytes);

    let mut bytes = None::<Vec<u8>>;
    let mut status = None;
    let mut errors = Vec::new();
    let mut warnings = None;
    let mut symbols = BTreeMap::<String, i64>::new();
    let mut base = None;
    for line in src.lines() {
        let Some(comment) = line.trim_start().strip_prefix(";!") else {
            continue;
        };
        let comment = comment.trim();
        let (kwd, params) = comment.split_once(' ').unwrap_or((comment, ""));
        let params = params.trim();
        match kwd.to_uppercase().as_str() {
            "BYTES" => {
                let expected = bytes.get_or_insert_with(Vec::new);
                for byte in params.split_whitespace() {
                    expected.push(
                        u8::from_str_radix(byte, 16)
                            .map_err(|x| TestError::InvalidParams("bytes", x.to_string()))?,
                    );
                }
            }
            "STATUS" => {
                status = Some(match params.to_lowercase().as_str() {
                    "succeeded" => Status::Succeeded,
                    "failed" => Status::Failed,
                    _ => return Err(TestError::InvalidParams("status", params.to_owned())),
                });
            }
            "ERROR" => {
                let Some((pos, kind)) = params.split_once(' ') else {
                    return Err(TestError::InvalidParams("error", params.to_owned()));
                };
                errors.push(format!("{} {}", pos.trim(), kind.trim()));
            }
            "WARNINGS" => {
                warnings = Some(
                    params
                        .parse::<usize>()
                        .map_err(|x| TestError::InvalidParams("warnings", x.to_string()))?,
                );
            }
            "SYMBOL" => {
                let Some((name, value)) = params.split_once(' ') else {
                    return Err(TestError::InvalidParams("symbol", params.to_owned()));
                };
                symbols.insert(name.to_owned(), parse_param(value.trim())?);
            }
            "BASE" => base = Some(parse_param(params)?),
            _ => return Err(TestError::InvalidComment(comment.to_owned())),
        }
    }

    // A fixture with no expectations is expected to assemble cleanly.
    let status = status.unwrap_or(if errors.is_empty() {
        Status::Succeeded
    } else {
        Status::Failed
    });
    assert_eq!(result.status, status, "status mismatch");
    let reported = result
        .diagnostics
        .iter()
        .filter(|d| d.severity >= Severity::Error)
        .map(|d| {
            format!(
                "{} {}",
                d.pos,
                d.kind.map_or_else(|| "-".to_owned(), |kind| kind.to_string())
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(reported, errors, "error diagnostics mismatch");
    if let Some(warnings) = warnings {
        assert_eq!(result.warnings, warnings, "warning count mismatch");
    }
    if let Some(bytes) = bytes {
        assert_eq!(result.bytes, bytes, "image mismatch");
    }
    for (name, value) in symbols {
        assert_eq!(
            result.symbols.get(&name),
            Some(&value),
            "mismatch on symbol {name}"
        );
    }
    if let Some(base) = base {
        assert_eq!(Some(result.base), u64::try_from(base).ok(), "base mismatch");
    }

    Ok(())
}

fn parse_param(params: &str) -> Result<i64, TestError> {
    let (negative, digits) = match params.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, params),
    };
    let value = parse_integer(digits)
        .map_err(|x| TestError::InvalidParams("number", x.to_string()))?;
    Ok(if negative { value.wrapping_neg() } else { value })
}
