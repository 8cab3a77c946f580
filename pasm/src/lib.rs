//! A table-driven two-pass assembler.
//!
//! The target machine is described by an [`InstructionSet`]; see [`isa`] for the
//! document format and [`assemble::Assembler`] for the entry point.

pub mod assemble;
pub mod diagnostics;
pub mod isa;

pub use assemble::{Assembler, AssemblyResult, ErrorKind, Status};
pub use diagnostics::{Diagnostic, Policy, Severity};
pub use isa::{InstructionSet, IsaError};

#[cfg(test)]
mod test;
