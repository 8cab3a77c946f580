//! Describes a target instruction set.
//!
//! Nothing about a concrete machine is hard-coded in the assembler: mnemonics, operand
//! shapes, bit layouts, registers and the directive vocabulary are all read from a JSON
//! document. [`InstructionSet::demo`] is a small sixteen-bit machine used by the tests
//! and as the CLI default.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use thiserror::Error;

pub mod encode;

const DEMO: &str = include_str!("../isa/demo.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// What a directive keyword does. The keywords themselves are configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirectiveKind {
    /// Moves the address counter.
    Origin,
    /// Emits each argument as a `width`-byte value.
    Data { width: u8 },
    /// Emits string bytes.
    Ascii,
    /// Emits string bytes, each string followed by a NUL.
    Asciz,
    /// Reserves a number of bytes, optionally filled with a given byte.
    Space,
    /// Pads to the next multiple of the argument.
    Align,
    /// Binds a name to a constant expression.
    Equ,
}

/// A bit field inside an encoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub shift: u8,
    pub width: u8,
    #[serde(default)]
    pub signed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperandSpec {
    Register {
        field: Field,
    },
    Immediate {
        field: Field,
    },
    /// An absolute address.
    Address {
        field: Field,
    },
    /// A target stored as `(target - (address + bias)) / scale`.
    /// `bias` defaults to the size of the instruction.
    Relative {
        field: Field,
        #[serde(default)]
        bias: Option<i64>,
        #[serde(default = "default_scale")]
        scale: u32,
    },
    /// `[base]` or `[base +/- displacement]`.
    Memory {
        base: Field,
        displacement: Field,
    },
}

fn default_scale() -> u32 {
    1
}

/// One encoding of a mnemonic. A mnemonic may have several forms, distinguished
/// by the kinds of their operands; the first form that matches is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionForm {
    /// Bits present in every encoding of this form.
    #[serde(deserialize_with = "number")]
    pub opcode: u64,
    /// Encoded size in bytes.
    pub size: u8,
    #[serde(default)]
    pub operands: Vec<OperandSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionSet {
    pub name: String,
    #[serde(default)]
    pub endian: Endian,
    #[serde(default, deserialize_with = "number")]
    pub default_origin: u64,
    #[serde(default)]
    pub registers: BTreeMap<String, u8>,
    #[serde(default)]
    pub directives: BTreeMap<String, DirectiveKind>,
    #[serde(default)]
    pub instructions: BTreeMap<String, Vec<InstructionForm>>,
}

/// How an identifier is classified by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Mnemonic,
    Directive,
    Register(u8),
}

#[derive(Debug, Error)]
pub enum IsaError {
    #[error("invalid instruction set document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{0}` is declared more than once (names are case-insensitive)")]
    NameClash(String),
    #[error("mnemonic `{0}` has no forms")]
    EmptyForms(String),
    #[error("mnemonic `{mnemonic}`: size {size} is not between 1 and 8 bytes")]
    FormSize { mnemonic: String, size: u8 },
    #[error("mnemonic `{mnemonic}`: opcode {opcode:#x} does not fit in {size} bytes")]
    OpcodeTooWide {
        mnemonic: String,
        opcode: u64,
        size: u8,
    },
    #[error(
        "mnemonic `{mnemonic}`: field at bit {shift} with width {width} does not fit in {size} bytes"
    )]
    FieldOutOfRange {
        mnemonic: String,
        shift: u8,
        width: u8,
        size: u8,
    },
    #[error("mnemonic `{0}`: relative operand scale must be non-zero")]
    ZeroScale(String),
    #[error("directive `{directive}`: data width {width} is not between 1 and 8 bytes")]
    DataWidth { directive: String, width: u8 },
    #[error("default origin {0:#x} is out of range")]
    Origin(u64),
}

impl InstructionSet {
    /// Parses, normalizes and validates a JSON instruction set description.
    pub fn from_json(text: &str) -> Result<InstructionSet, IsaError> {
        let isa: InstructionSet = serde_json::from_str(text)?;
        isa.prepare()
    }

    /// The bundled sixteen-bit demonstration machine.
    pub fn demo() -> Result<InstructionSet, IsaError> {
        InstructionSet::from_json(DEMO)
    }

    /// Lowercases every keyword and validates the result.
    pub fn prepare(self) -> Result<InstructionSet, IsaError> {
        let mut seen = BTreeMap::new();
        let mut claim = |name: &str| -> Result<String, IsaError> {
            let lower = name.to_lowercase();
            if seen.insert(lower.clone(), ()).is_some() {
                return Err(IsaError::NameClash(name.to_owned()));
            }
            Ok(lower)
        };

        let mut registers = BTreeMap::new();
        for (name, number) in self.registers {
            registers.insert(claim(&name)?, number);
        }
        let mut directives = BTreeMap::new();
        for (name, kind) in self.directives {
            directives.insert(claim(&name)?, kind);
        }
        let mut instructions = BTreeMap::new();
        for (name, forms) in self.instructions {
            instructions.insert(claim(&name)?, forms);
        }

        let isa = InstructionSet {
            name: self.name,
            endian: self.endian,
            default_origin: self.default_origin,
            registers,
            directives,
            instructions,
        };
        isa.validate()?;
        Ok(isa)
    }

    fn validate(&self) -> Result<(), IsaError> {
        if i64::try_from(self.default_origin).is_err() {
            return Err(IsaError::Origin(self.default_origin));
        }
        for (directive, kind) in &self.directives {
            if let DirectiveKind::Data { width } = *kind
                && !(1..=8).contains(&width)
            {
                return Err(IsaError::DataWidth {
                    directive: directive.clone(),
                    width,
                });
            }
        }

        for (mnemonic, forms) in &self.instructions {
            if forms.is_empty() {
                return Err(IsaError::EmptyForms(mnemonic.clone()));
            }
            for form in forms {
                if !(1..=8).contains(&form.size) {
                    return Err(IsaError::FormSize {
                        mnemonic: mnemonic.clone(),
                        size: form.size,
                    });
                }
                let bits = u32::from(form.size) * 8;
                if bits < 64 && form.opcode >> bits != 0 {
                    return Err(IsaError::OpcodeTooWide {
                        mnemonic: mnemonic.clone(),
                        opcode: form.opcode,
                        size: form.size,
                    });
                }
                for operand in &form.operands {
                    if let OperandSpec::Relative { scale: 0, .. } = operand {
                        return Err(IsaError::ZeroScale(mnemonic.clone()));
                    }
                    for field in operand.fields() {
                        let end = u32::from(field.shift) + u32::from(field.width);
                        if field.width == 0 || field.width > 64 || end > bits {
                            return Err(IsaError::FieldOutOfRange {
                                mnemonic: mnemonic.clone(),
                                shift: field.shift,
                                width: field.width,
                                size: form.size,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The address assembly starts at when no origin directive comes first.
    pub fn origin(&self) -> i64 {
        i64::try_from(self.default_origin).unwrap_or_default()
    }

    pub fn classify(&self, name: &str) -> Option<Keyword> {
        let lower = name.to_lowercase();
        if let Some(&number) = self.registers.get(&lower) {
            Some(Keyword::Register(number))
        } else if self.instructions.contains_key(&lower) {
            Some(Keyword::Mnemonic)
        } else if self.directives.contains_key(&lower) {
            Some(Keyword::Directive)
        } else {
            None
        }
    }

    pub fn forms(&self, mnemonic: &str) -> Option<&[InstructionForm]> {
        self.instructions
            .get(&mnemonic.to_lowercase())
            .map(Vec::as_slice)
    }

    pub fn directive(&self, name: &str) -> Option<DirectiveKind> {
        self.directives.get(&name.to_lowercase()).copied()
    }
}

impl OperandSpec {
    /// The bit fields this operand writes.
    pub fn fields(&self) -> Vec<Field> {
        match *self {
            OperandSpec::Register { field }
            | OperandSpec::Immediate { field }
            | OperandSpec::Address { field }
            | OperandSpec::Relative { field, .. } => vec![field],
            OperandSpec::Memory { base, displacement } => vec![base, displacement],
        }
    }
}

/// Accepts either a JSON integer or a string such as `"0x1F00"`.
fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Int(u64),
        Text(String),
    }

    match Number::deserialize(deserializer)? {
        Number::Int(value) => Ok(value),
        Number::Text(text) => {
            let text = text.trim().replace('_', "");
            let parsed = if let Some(hex) = text.strip_prefix("0x").or(text.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else if let Some(bin) = text.strip_prefix("0b").or(text.strip_prefix("0B")) {
                u64::from_str_radix(bin, 2)
            } else {
                text.parse()
            };
            parsed.map_err(|err| D::Error::custom(format!("invalid number `{text}`: {err}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_instruction_set_is_valid() {
        let isa = InstructionSet::from_json(DEMO).unwrap();
        assert_eq!(isa.endian, Endian::Big);
        assert_eq!(isa.classify("LOADIMM"), Some(Keyword::Mnemonic));
        assert_eq!(isa.classify("sp"), Some(Keyword::Register(7)));
        assert_eq!(isa.classify(".ORG"), Some(Keyword::Directive));
        assert_eq!(isa.classify("start"), None);
        assert_eq!(isa.forms("jump").unwrap()[0].opcode, 0x02_0000);
    }

    #[test]
    fn rejects_clashing_names() {
        let err = InstructionSet::from_json(
            r#"{ "name": "x", "registers": { "A": 0, "a": 1 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IsaError::NameClash(_)));

        let err = InstructionSet::from_json(
            r#"{ "name": "x",
                 "registers": { "nop": 0 },
                 "instructions": { "NOP": [ { "opcode": 0, "size": 1 } ] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IsaError::NameClash(_)));
    }

    #[test]
    fn rejects_fields_outside_the_word() {
        let err = InstructionSet::from_json(
            r#"{ "name": "x", "instructions": { "ld": [ {
                 "opcode": "0x10", "size": 1,
                 "operands": [ { "kind": "immediate", "field": { "shift": 4, "width": 8 } } ] } ] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IsaError::FieldOutOfRange { .. }));
    }

    #[test]
    fn rejects_wide_opcode_and_bad_sizes() {
        let err = InstructionSet::from_json(
            r#"{ "name": "x", "instructions": { "ld": [ { "opcode": "0x1FF", "size": 1 } ] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IsaError::OpcodeTooWide { .. }));

        let err = InstructionSet::from_json(
            r#"{ "name": "x", "instructions": { "ld": [ { "opcode": 0, "size": 9 } ] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IsaError::FormSize { .. }));

        let err = InstructionSet::from_json(
            r#"{ "name": "x", "directives": { ".quad": { "kind": "data", "width": 16 } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IsaError::DataWidth { .. }));
    }

    #[test]
    fn relative_defaults() {
        let isa = InstructionSet::demo().unwrap();
        let form = &isa.forms("bra").unwrap()[0];
        assert_eq!(
            form.operands[0],
            OperandSpec::Relative {
                field: Field {
                    shift: 0,
                    width: 8,
                    signed: true
                },
                bias: None,
                scale: 1,
            }
        );
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            InstructionSet::from_json("{ \"name\": "),
            Err(IsaError::Json(_))
        ));
    }
}
