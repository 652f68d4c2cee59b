//! Core IR, traits, errors, and dispatch for the mz2c static translator.
//!
//! mz2c turns a real-mode 8086 MZ executable into C source that reproduces
//! the program when compiled against a small runtime (register state,
//! memory array, interrupt dispatch). The pipeline runs one way:
//! executable image, disassembled instruction stream, subroutine graphs,
//! generated source.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use mz2c::{
//!     analysis::Program,
//!     codegen::CodeGen,
//!     config::{Directives, TranslatorOptions},
//!     decoder::CapstoneDisassembler,
//!     parser::parse_mz,
//!     store::InstructionStore,
//! };
//!
//! let bytes = fs::read("path/to/GAME.EXE").unwrap();
//! let options = TranslatorOptions::default();
//! let image = parse_mz(&bytes, options.load_segment).unwrap();
//!
//! let directives = Directives::default();
//! let mut store = InstructionStore::new(
//!     &image,
//!     Box::new(CapstoneDisassembler::new().unwrap()),
//!     &options,
//! );
//! store.install_patches(&directives.patches).unwrap();
//!
//! let program = Program::analyze(&mut store, &image, &options).unwrap();
//! let source = CodeGen::new(&directives.hook_table().unwrap())
//!     .program(&program)
//!     .unwrap();
//! fs::write("game.c", source).unwrap();
//! ```

pub mod address;
pub mod analysis;
pub mod codegen;
pub mod config;
pub mod decoder;
pub mod instruction;
pub mod operand;
pub mod parser;
pub mod report;
pub mod store;
mod large_tests;

pub use address::Address;

use std::fmt;

/// One textual instruction as produced by a disassembly backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Offset of the instruction within its code segment
    pub offset: u16,
    /// Raw encoding bytes
    pub bytes: Vec<u8>,
    /// Instruction mnemonic (e.g., "mov", "rep movsw")
    pub mnemonic: String,
    /// Operand text, comma separated, as the backend printed it
    pub operands: String,
}

impl RawRecord {
    /// Record for `bytes` at `offset`, with the operand text trimmed.
    pub fn new(offset: u16, bytes: &[u8], mnemonic: &str, operands: &str) -> Self {
        Self {
            offset,
            bytes: bytes.to_vec(),
            mnemonic: mnemonic.trim().to_lowercase(),
            operands: operands.trim().to_string(),
        }
    }

    /// Split `mnemonic operands` text. A leading repeat or lock prefix
    /// stays with the mnemonic (`rep movsw`).
    pub fn from_text(offset: u16, bytes: &[u8], text: &str) -> Self {
        let (first, rest) = split_word(text);
        let is_prefix = matches!(
            first.to_lowercase().as_str(),
            "rep" | "repe" | "repz" | "repne" | "repnz" | "lock"
        );
        if is_prefix && !rest.is_empty() {
            let (inner, tail) = split_word(rest);
            return Self::new(offset, bytes, &format!("{} {}", first, inner), tail);
        }
        Self::new(offset, bytes, first, rest)
    }

    /// Encoding length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Encoding as a lowercase hex string, no separators.
    pub fn hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Disassembly backend: turns a run of code bytes into textual records.
///
/// The translator treats a backend as a pure function it may call as often
/// as it likes, over overlapping ranges.
pub trait Disassembler {
    /// Disassemble at most `count` instructions from `code`.
    ///
    /// # Arguments
    /// * `code` - Bytes starting at the first instruction
    /// * `origin` - Segment offset of `code[0]`
    /// * `count` - Upper bound on the number of records returned
    fn disassemble(
        &mut self,
        code: &[u8],
        origin: u16,
        count: usize,
    ) -> Result<Vec<RawRecord>, TranslateError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Broad class of a translation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed header or disassembler output
    Format,
    /// Operand syntax or width problems
    Decode,
    /// Control flow that cannot be resolved statically
    ControlFlow,
    /// No emitter, or an emitter hit an impossible operand
    Codegen,
    /// I/O and configuration problems outside the binary itself
    Environment,
}

/// Error type for translation. Every variant is fatal.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// Malformed executable header or load module
    #[error("Malformed executable: {0}")]
    Header(String),

    /// Disassembly backend failed or produced unreadable output
    #[error("Disassembler error at {address}: {reason}")]
    Disassembler { address: Address, reason: String },

    /// Nothing could be decoded at an address the analysis reached
    #[error("No instruction at {0}")]
    NoInstruction(Address),

    /// Operand text has none of the recognised shapes
    #[error("Unsupported operand `{text}` at {address} in `{line}`")]
    UnsupportedOperand {
        address: Address,
        text: String,
        line: String,
    },

    /// Sibling operands declare different widths
    #[error("Contradictory width at {address}: {first} vs {second} in `{line}`")]
    ContradictoryWidth {
        address: Address,
        first: u8,
        second: u8,
        line: String,
    },

    /// Text that should have been a `SSSS:OOOO` address
    #[error("Invalid address `{0}`")]
    InvalidAddress(String),

    /// Register-indirect jump or call without a patch
    #[error("Dynamic branch unsupported at {address}: `{line}` (install a patch)")]
    DynamicBranch { address: Address, line: String },

    /// Opcode without an emitter
    #[error("Unimplemented opcode `{opcode}` at {address} in `{line}`")]
    UnimplementedOpcode {
        address: Address,
        opcode: String,
        line: String,
    },

    /// Emitter hit an operand shape it cannot render
    #[error("Codegen error at {address}: {reason} in `{line}`")]
    Codegen {
        address: Address,
        reason: String,
        line: String,
    },

    /// Directive file problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranslateError {
    /// Broad category of this error, for reporting.
    pub fn class(&self) -> ErrorClass {
        match self {
            TranslateError::Header(_)
            | TranslateError::Disassembler { .. }
            | TranslateError::NoInstruction(_) => ErrorClass::Format,
            TranslateError::UnsupportedOperand { .. }
            | TranslateError::ContradictoryWidth { .. }
            | TranslateError::InvalidAddress(_) => ErrorClass::Decode,
            TranslateError::DynamicBranch { .. } => ErrorClass::ControlFlow,
            TranslateError::UnimplementedOpcode { .. } | TranslateError::Codegen { .. } => {
                ErrorClass::Codegen
            }
            TranslateError::Config(_) | TranslateError::Io(_) => ErrorClass::Environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_record_normalizes() {
        let rec = RawRecord::new(0x100, &[0xb8, 0x01, 0x00], " MOV ", " ax, 1 ");
        assert_eq!(rec.mnemonic, "mov");
        assert_eq!(rec.operands, "ax, 1");
        assert_eq!(rec.len(), 3);
        assert_eq!(rec.hex(), "b80100");
        assert_eq!(rec.to_string(), "mov ax, 1");
    }

    #[test]
    fn test_raw_record_from_text() {
        let rec = RawRecord::from_text(0, &[0xe8, 0, 0], "call   1000:0200");
        assert_eq!(rec.mnemonic, "call");
        assert_eq!(rec.operands, "1000:0200");

        let rec = RawRecord::from_text(0, &[0xf3, 0xa5], "rep movsw");
        assert_eq!(rec.mnemonic, "rep movsw");
        assert_eq!(rec.operands, "");

        let rec = RawRecord::from_text(0, &[0xf3], "rep");
        assert_eq!(rec.mnemonic, "rep");
    }

    #[test]
    fn test_error_classes() {
        let at = Address::new(0x1000, 0x10);
        assert_eq!(TranslateError::Header("short".into()).class(), ErrorClass::Format);
        assert_eq!(
            TranslateError::DynamicBranch { address: at, line: "jmp bx".into() }.class(),
            ErrorClass::ControlFlow
        );
        assert_eq!(
            TranslateError::UnimplementedOpcode {
                address: at,
                opcode: "daa".into(),
                line: "daa".into(),
            }
            .class(),
            ErrorClass::Codegen
        );
    }

    #[test]
    fn test_errors_name_the_address() {
        let err = TranslateError::DynamicBranch {
            address: Address::new(0x1000, 0x0123),
            line: "call word ptr [bx]".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("1000:0123"));
        assert!(msg.contains("call word ptr [bx]"));
    }
}
