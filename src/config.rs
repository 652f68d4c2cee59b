//! Translator options and the patch/hook directive file.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::decoder::parse_hex_bytes;
use crate::instruction::BranchBase;
use crate::{Address, RawRecord, TranslateError};

/// Which part of the load module is copied into memory at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataPolicy {
    /// Only the bytes below the lowest translated instruction
    #[default]
    Prefix,
    /// The whole load module, code included
    FullImage,
}

impl fmt::Display for DataPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPolicy::Prefix => write!(f, "prefix"),
            DataPolicy::FullImage => write!(f, "full-image"),
        }
    }
}

/// Knobs shared by the store, the analyzers and the code generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorOptions {
    /// Instructions requested from the backend per batch
    pub batch_size: usize,
    pub branch_base: BranchBase,
    /// Segment of the first load-module byte
    pub load_segment: u16,
    pub data_policy: DataPolicy,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            branch_base: BranchBase::Segment,
            load_segment: 0x1000,
            data_policy: DataPolicy::Prefix,
        }
    }
}

/// A hand-written instruction that replaces disassembly at one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchDirective {
    /// `SSSS:OOOO`
    pub address: String,
    /// Encoding of the patched instruction, hex; sets its length
    pub bytes: String,
    /// `mnemonic operands`; branch targets must be absolute
    pub instruction: String,
}

impl PatchDirective {
    /// Parsed `SSSS:OOOO` target.
    pub fn address(&self) -> Result<Address, TranslateError> {
        self.address.parse()
    }

    /// The bytes the patched instruction occupies.
    pub fn encoding(&self) -> Result<Vec<u8>, TranslateError> {
        let compact: String = self.bytes.chars().filter(|c| !c.is_whitespace()).collect();
        parse_hex_bytes(&compact).ok_or_else(|| {
            TranslateError::Config(format!(
                "patch at {}: `{}` is not a non-empty hex byte string",
                self.address, self.bytes
            ))
        })
    }

    /// The patch as a backend-style record at its address.
    pub fn record(&self) -> Result<(Address, RawRecord), TranslateError> {
        let address = self.address()?;
        let bytes = self.encoding()?;
        Ok((address, RawRecord::from_text(address.offset(), &bytes, &self.instruction)))
    }
}

/// C statements emitted just before the instruction at `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookDirective {
    pub address: String,
    pub code: String,
}

/// The directive file: patches and hooks for one executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Directives {
    #[serde(default)]
    pub patches: Vec<PatchDirective>,
    #[serde(default)]
    pub hooks: Vec<HookDirective>,
}

impl Directives {
    /// Read a directive file from disk.
    pub fn load(path: &Path) -> Result<Self, TranslateError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| TranslateError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse directives from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Hooks keyed by linear address, in file order per address.
    pub fn hook_table(&self) -> Result<HashMap<u32, Vec<String>>, TranslateError> {
        let mut table: HashMap<u32, Vec<String>> = HashMap::new();
        for hook in &self.hooks {
            let address: Address = hook.address.parse()?;
            table.entry(address.linear()).or_default().push(hook.code.clone());
        }
        Ok(table)
    }
}
