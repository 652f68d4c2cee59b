//! The instruction store: a lazily filled decode arena behind a patch table.

use std::collections::HashMap;

use crate::config::{PatchDirective, TranslatorOptions};
use crate::instruction::{decode, fold_prefixes, BranchBase, Instruction};
use crate::parser::LoadedImage;
use crate::{Address, Disassembler, RawRecord, TranslateError};

/// Longest 8086 encoding we budget per requested instruction, prefixes
/// included.
const BYTES_PER_INSTRUCTION: usize = 8;

/// Maps addresses to decoded instructions.
///
/// Patches are consulted first and never overwritten. Everything else comes
/// from batched disassembly: a batch is folded and kept as raw records, and a
/// record is decoded only when somebody fetches its address, so bytes past
/// the real code never produce errors unless control actually reaches them.
pub struct InstructionStore<'a> {
    image: &'a LoadedImage,
    backend: Box<dyn Disassembler>,
    batch_size: usize,
    branch_base: BranchBase,
    patches: HashMap<u32, Instruction>,
    pending: HashMap<u32, (Address, RawRecord)>,
    arena: Vec<Instruction>,
    index: HashMap<u32, usize>,
    batches: usize,
}

impl<'a> InstructionStore<'a> {
    /// Empty store decoding `image` through `backend`.
    pub fn new(
        image: &'a LoadedImage,
        backend: Box<dyn Disassembler>,
        options: &TranslatorOptions,
    ) -> Self {
        Self {
            image,
            backend,
            batch_size: options.batch_size.max(1),
            branch_base: options.branch_base,
            patches: HashMap::new(),
            pending: HashMap::new(),
            arena: Vec::new(),
            index: HashMap::new(),
            batches: 0,
        }
    }

    /// Install a hand-written instruction at `address`. It is decoded without
    /// base context, so branch targets in `text` must be `SSSS:OOOO`.
    pub fn patch(&mut self, address: Address, bytes: &[u8], text: &str) -> Result<(), TranslateError> {
        self.insert_patch(address, &RawRecord::from_text(address.offset(), bytes, text))
    }

    /// Decode and install every patch directive.
    pub fn install_patches(&mut self, patches: &[PatchDirective]) -> Result<(), TranslateError> {
        for directive in patches {
            let (address, record) = directive.record()?;
            self.insert_patch(address, &record)?;
        }
        if !patches.is_empty() {
            log::info!("{} patches installed", patches.len());
        }
        Ok(())
    }

    fn insert_patch(&mut self, address: Address, record: &RawRecord) -> Result<(), TranslateError> {
        let insn = decode(record, address, None)?;
        log::debug!("patch installed at {}: {}", address, insn.text);
        self.patches.insert(address.linear(), insn);
        Ok(())
    }

    pub fn is_patched(&self, address: Address) -> bool {
        self.patches.contains_key(&address.linear())
    }

    /// The instruction at `address`, disassembling a new batch if needed.
    pub fn fetch(&mut self, address: Address) -> Result<&Instruction, TranslateError> {
        let linear = address.linear();
        if self.patches.contains_key(&linear) {
            return Ok(&self.patches[&linear]);
        }
        if let Some(i) = self.index.get(&linear).copied() {
            return Ok(&self.arena[i]);
        }
        if !self.pending.contains_key(&linear) {
            self.load_batch(address)?;
        }
        let (at, record) = self
            .pending
            .remove(&linear)
            .ok_or(TranslateError::NoInstruction(address))?;
        let insn = decode(&record, at, Some(self.branch_base))?;
        self.arena.push(insn);
        self.index.insert(linear, self.arena.len() - 1);
        Ok(&self.arena[self.arena.len() - 1])
    }

    fn load_batch(&mut self, address: Address) -> Result<(), TranslateError> {
        let room = 0x10000 - address.offset() as usize;
        let max = (self.batch_size * BYTES_PER_INSTRUCTION).min(room);
        let code = self.image.code_at(address, max);
        if code.is_empty() {
            return Err(TranslateError::NoInstruction(address));
        }

        let records = self
            .backend
            .disassemble(code, address.offset(), self.batch_size)
            .map_err(|e| match e {
                TranslateError::Disassembler { reason, .. } => {
                    TranslateError::Disassembler { address, reason }
                }
                other => other,
            })?;
        self.batches += 1;

        let produced = records.len();
        let mut kept = 0;
        for record in fold_prefixes(records) {
            let at = Address::new(address.segment(), record.offset);
            let linear = at.linear();
            if self.patches.contains_key(&linear) || self.index.contains_key(&linear) {
                continue;
            }
            self.pending.entry(linear).or_insert((at, record));
            kept += 1;
        }
        log::debug!(
            "{} batch {} at {}: {} records, {} new",
            self.backend.name(),
            self.batches,
            address,
            produced,
            kept
        );
        if produced <= 1 {
            log::warn!("batch at {} produced {} instructions", address, produced);
        }
        Ok(())
    }

    /// Backend batches run so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Instructions decoded from disassembly so far (patches excluded).
    pub fn decoded(&self) -> usize {
        self.arena.len()
    }
}
