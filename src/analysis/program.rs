//! Whole-program discovery: every subroutine reachable from the entry point.

use std::collections::BTreeMap;

use crate::config::{DataPolicy, TranslatorOptions};
use crate::parser::LoadedImage;
use crate::store::InstructionStore;
use crate::{Address, TranslateError};

use super::Subroutine;

/// The analyzed program, ready for code generation.
#[derive(Debug, Clone)]
pub struct Program {
    pub entry: Address,
    /// Keyed by the linear entry address
    pub subroutines: BTreeMap<u32, Subroutine>,
    /// Linear address where `data_image` is copied at start-up
    pub data_base: u32,
    pub data_image: Vec<u8>,
    pub memory_size: u32,
    /// Initial SS:SP
    pub stack: Address,
    pub psp_segment: u16,
}

impl Program {
    /// Analyze the entry point and every callee transitively, to a fixpoint.
    pub fn analyze(
        store: &mut InstructionStore<'_>,
        image: &LoadedImage,
        options: &TranslatorOptions,
    ) -> Result<Self, TranslateError> {
        let mut subroutines: BTreeMap<u32, Subroutine> = BTreeMap::new();
        let mut stack = vec![image.entry];

        while let Some(entry) = stack.pop() {
            if subroutines.contains_key(&entry.linear()) {
                continue;
            }
            let sub = Subroutine::analyze(store, entry)?;
            stack.extend(sub.calls_to.iter().rev().copied());
            subroutines.insert(entry.linear(), sub);
        }

        let lowest = subroutines
            .values()
            .filter_map(Subroutine::lowest)
            .min()
            .unwrap_or(image.base.linear());
        let data_base = image.base.linear();
        let data_image = match options.data_policy {
            DataPolicy::Prefix => image.slice_linear(data_base, lowest).to_vec(),
            DataPolicy::FullImage => image.bytes.clone(),
        };

        let program = Program {
            entry: image.entry,
            subroutines,
            data_base,
            data_image,
            memory_size: image.memory_size(),
            stack: image.stack,
            psp_segment: image.psp_segment,
        };
        log::info!(
            "analysis complete: {} subroutines, {} instructions, {} data bytes, {} disassembly batches",
            program.subroutines.len(),
            program.instruction_count(),
            program.data_image.len(),
            store.batches()
        );
        Ok(program)
    }

    /// Instructions across all subroutines.
    pub fn instruction_count(&self) -> usize {
        self.subroutines.values().map(|s| s.steps.len()).sum()
    }

    /// The subroutine at the program entry point.
    pub fn entry_subroutine(&self) -> Option<&Subroutine> {
        self.subroutines.get(&self.entry.linear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::scripted::{image, Scripted};
    use std::collections::BTreeSet;

    const SEG: u16 = 0x1000;

    fn run(
        listing: &[(u16, usize, &str)],
        entry: u16,
        data_policy: DataPolicy,
    ) -> Result<Program, TranslateError> {
        let mut image = image();
        image.entry = Address::new(SEG, entry);
        let options = TranslatorOptions {
            data_policy,
            ..TranslatorOptions::default()
        };
        let mut store = InstructionStore::new(&image, Box::new(Scripted::new(listing)), &options);
        Program::analyze(&mut store, &image, &options)
    }

    const CHAIN: &[(u16, usize, &str)] = &[
        (0x100, 3, "call 0x200"),
        (0x103, 1, "ret"),
        (0x200, 3, "call 0x300"),
        (0x203, 1, "ret"),
        (0x300, 1, "ret"),
        // Never called.
        (0x400, 1, "ret"),
    ];

    #[test]
    fn test_call_discovery_closure() {
        let program = run(CHAIN, 0x100, DataPolicy::Prefix).unwrap();
        let entries: BTreeSet<u32> = program.subroutines.keys().copied().collect();
        assert_eq!(entries, BTreeSet::from([0x10100, 0x10200, 0x10300]));
        assert_eq!(program.instruction_count(), 5);
        assert_eq!(program.entry_subroutine().unwrap().entry, Address::new(SEG, 0x100));
    }

    #[test]
    fn test_recursive_calls_terminate() {
        let program = run(
            &[
                (0x100, 3, "call 0x200"),
                (0x103, 1, "ret"),
                (0x200, 3, "call 0x100"),
                (0x203, 1, "ret"),
            ],
            0x100,
            DataPolicy::Prefix,
        )
        .unwrap();
        assert_eq!(program.subroutines.len(), 2);
    }

    #[test]
    fn test_data_image_policies() {
        let program = run(CHAIN, 0x100, DataPolicy::Prefix).unwrap();
        assert_eq!(program.data_base, 0x10000);
        assert_eq!(program.data_image.len(), 0x100);

        let program = run(CHAIN, 0x100, DataPolicy::FullImage).unwrap();
        assert_eq!(program.data_image.len(), 0x1000);
    }

    #[test]
    fn test_errors_in_callees_propagate() {
        let err = run(
            &[(0x100, 3, "call 0x200"), (0x103, 1, "ret"), (0x200, 2, "call ax")],
            0x100,
            DataPolicy::Prefix,
        )
        .unwrap_err();
        assert!(matches!(err, TranslateError::DynamicBranch { .. }));
    }
}
