//! Disassembly backends: in-process capstone and an `ndisasm` subprocess.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use capstone::arch::x86::{ArchMode as X86Mode, ArchSyntax};
use capstone::prelude::*;
use capstone::Capstone;
use clap::ValueEnum;

use crate::{Address, Disassembler, RawRecord, TranslateError};

/// Available disassembly backends.
#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq, Default)]
pub enum Backend {
    /// In-process capstone, 16-bit x86 mode
    #[default]
    Capstone,
    /// External `ndisasm -b 16`, one subprocess per batch
    Ndisasm,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Capstone => write!(f, "capstone"),
            Backend::Ndisasm => write!(f, "ndisasm"),
        }
    }
}

impl Backend {
    /// Build the selected backend. `ndisasm` names the executable to run.
    pub fn build(&self, ndisasm: Option<PathBuf>) -> Result<Box<dyn Disassembler>, TranslateError> {
        match self {
            Backend::Capstone => Ok(Box::new(CapstoneDisassembler::new()?)),
            Backend::Ndisasm => Ok(Box::new(NdisasmDisassembler::new(
                ndisasm.unwrap_or_else(|| PathBuf::from("ndisasm")),
            ))),
        }
    }
}

fn backend_error(origin: u16, reason: impl Into<String>) -> TranslateError {
    TranslateError::Disassembler {
        address: Address::new(0, origin),
        reason: reason.into(),
    }
}

/// A capstone handle configured for real-mode code.
pub struct CapstoneDisassembler {
    cs: Capstone,
}

impl fmt::Debug for CapstoneDisassembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDisassembler(x86-16)")
    }
}

impl CapstoneDisassembler {
    /// Capstone in 16-bit x86 mode with Intel syntax.
    pub fn new() -> Result<Self, TranslateError> {
        let cs = Capstone::new()
            .x86()
            .mode(X86Mode::Mode16)
            .syntax(ArchSyntax::Intel)
            .detail(false)
            .build()
            .map_err(|e| backend_error(0, format!("capstone: {}", e)))?;
        Ok(Self { cs })
    }
}

impl Disassembler for CapstoneDisassembler {
    fn disassemble(
        &mut self,
        code: &[u8],
        origin: u16,
        count: usize,
    ) -> Result<Vec<RawRecord>, TranslateError> {
        let insns = self
            .cs
            .disasm_count(code, origin as u64, count)
            .map_err(|e| backend_error(origin, format!("capstone: {}", e)))?;

        let records = insns
            .iter()
            .map(|i| {
                RawRecord::new(
                    i.address() as u16,
                    i.bytes(),
                    i.mnemonic().unwrap_or(""),
                    i.op_str().unwrap_or(""),
                )
            })
            .collect::<Vec<_>>();
        log::debug!(
            "capstone decoded {} instructions from offset 0x{:04x}",
            records.len(),
            origin
        );
        Ok(records)
    }

    fn name(&self) -> &'static str {
        "capstone"
    }
}

/// Runs `ndisasm` on each batch, feeding the bytes through stdin.
#[derive(Debug, Clone)]
pub struct NdisasmDisassembler {
    program: PathBuf,
}

impl NdisasmDisassembler {
    /// Backend that runs `program` for each batch.
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

impl Disassembler for NdisasmDisassembler {
    fn disassemble(
        &mut self,
        code: &[u8],
        origin: u16,
        count: usize,
    ) -> Result<Vec<RawRecord>, TranslateError> {
        let mut child = Command::new(&self.program)
            .args(["-b", "16", "-o", &format!("0x{:x}", origin), "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| backend_error(origin, format!("cannot run {}: {}", self.program.display(), e)))?;

        // Check the exit status before the write: a child that dies early
        // also breaks the pipe.
        let fed = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(code),
            None => Ok(()),
        };
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(backend_error(
                origin,
                format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        fed.map_err(|e| backend_error(origin, format!("cannot feed {}: {}", self.program.display(), e)))?;

        let listing = String::from_utf8_lossy(&output.stdout);
        let records = parse_listing(&listing, origin, count)?;
        log::debug!(
            "ndisasm decoded {} instructions from offset 0x{:04x}",
            records.len(),
            origin
        );
        Ok(records)
    }

    fn name(&self) -> &'static str {
        "ndisasm"
    }
}

/// Decode a run of hex digit pairs; `None` on anything else.
pub(crate) fn parse_hex_bytes(hex: &str) -> Option<Vec<u8>> {
    if !hex.is_ascii() || hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

/// Parse an ndisasm listing: `OFFSET  HEXBYTES  mnemonic operands`, with
/// `-HEX` continuation lines for long encodings.
pub fn parse_listing(listing: &str, origin: u16, count: usize) -> Result<Vec<RawRecord>, TranslateError> {
    let mut records: Vec<RawRecord> = Vec::new();
    for line in listing.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || backend_error(origin, format!("malformed listing line `{}`", line));

        if line.starts_with(char::is_whitespace) {
            let hex = line.trim().strip_prefix('-').ok_or_else(malformed)?;
            let more = parse_hex_bytes(hex).ok_or_else(malformed)?;
            records.last_mut().ok_or_else(malformed)?.bytes.extend(more);
            continue;
        }
        if records.len() == count {
            break;
        }

        let (offset, rest) = split_word(line);
        let (hex, rest) = split_word(rest);
        let offset = u32::from_str_radix(offset, 16).map_err(|_| malformed())?;
        let bytes = parse_hex_bytes(hex).ok_or_else(malformed)?;

        if rest.is_empty() {
            return Err(malformed());
        }
        records.push(RawRecord::from_text(offset as u16, &bytes, rest));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorClass;

    #[test]
    fn test_backend_display() {
        assert_eq!(Backend::Capstone.to_string(), "capstone");
        assert_eq!(Backend::Ndisasm.to_string(), "ndisasm");
    }

    #[test]
    fn test_capstone_real_mode_decode() {
        // mov ax, 1 ; ret
        let bytes = [0xb8, 0x01, 0x00, 0xc3];
        let mut cs = CapstoneDisassembler::new().unwrap();
        let records = cs.disassemble(&bytes, 0x100, 10).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mnemonic, "mov");
        assert_eq!(records[0].offset, 0x100);
        assert_eq!(records[0].bytes, vec![0xb8, 0x01, 0x00]);
        assert!(records[0].operands.starts_with("ax"));
        assert_eq!(records[1].mnemonic, "ret");
        assert_eq!(records[1].offset, 0x103);
    }

    #[test]
    fn test_capstone_respects_count() {
        let bytes = [0x90; 16];
        let mut cs = CapstoneDisassembler::new().unwrap();
        let records = cs.disassemble(&bytes, 0, 4).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].offset, 3);
    }

    #[test]
    fn test_parse_listing() {
        let listing = "\
00000100  B80100            mov ax,0x1
00000103  F3A5              rep movsw
00000105  C70600020100      mov word [0x200],0x1
0000010B  EA00020020        jmp 0x2000:0x200
00000110  C3                ret
";
        let records = parse_listing(listing, 0x100, 100).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].operands, "ax,0x1");
        assert_eq!(records[1].mnemonic, "rep movsw");
        assert_eq!(records[1].operands, "");
        assert_eq!(records[2].operands, "word [0x200],0x1");
        assert_eq!(records[2].len(), 6);
        assert_eq!(records[3].offset, 0x10b);
        assert_eq!(records[4].mnemonic, "ret");
    }

    #[test]
    fn test_parse_listing_continuation_and_count() {
        let listing = "\
00000000  2EC7060001341200  mov word [cs:0x100],0x1234
         -00
00000009  90                nop
0000000A  90                nop
";
        let records = parse_listing(listing, 0, 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].len(), 9);
        assert_eq!(records[1].mnemonic, "nop");
    }

    #[test]
    fn test_ndisasm_nonzero_exit_is_format_error() {
        let mut backend = NdisasmDisassembler::new(PathBuf::from("false"));
        let err = backend.disassemble(&[0x90, 0xc3], 0x100, 10).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Format);
        match err {
            TranslateError::Disassembler { address, reason } => {
                assert_eq!(address.offset(), 0x100);
                assert!(reason.contains("exited with"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ndisasm_missing_program_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = NdisasmDisassembler::new(dir.path().join("ndisasm"));
        let err = backend.disassemble(&[0xc3], 0, 10).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Format);
        match err {
            TranslateError::Disassembler { reason, .. } => {
                assert!(reason.starts_with("cannot run"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("ffd3"), Some(vec![0xff, 0xd3]));
        assert_eq!(parse_hex_bytes("a\u{e9}b"), None);
        assert_eq!(parse_hex_bytes("fd3"), None);
        assert_eq!(parse_hex_bytes(""), None);
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        let err = parse_listing("not a listing\n", 0, 10).unwrap_err();
        assert!(matches!(err, TranslateError::Disassembler { .. }));
    }
}
