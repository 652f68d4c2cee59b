//! Subroutine discovery from a single entry point.

use std::collections::{BTreeMap, BTreeSet};

use crate::instruction::Instruction;
use crate::store::InstructionStore;
use crate::{Address, TranslateError};

/// One reached instruction and the instruction that led to it.
#[derive(Debug, Clone)]
pub struct Step {
    pub insn: Instruction,
    /// Predecessor that pushed this address; `None` for the entry
    pub referent: Option<Address>,
}

/// Everything reachable from one entry point without following calls.
#[derive(Debug, Clone)]
pub struct Subroutine {
    pub entry: Address,
    /// Sorted by address
    pub steps: Vec<Step>,
    /// Linear addresses that need a label in the generated body
    pub labels: BTreeSet<u32>,
    /// Entry points of called subroutines
    pub calls_to: BTreeSet<Address>,
}

impl Subroutine {
    /// Explore from `entry` with an explicit work stack.
    ///
    /// Calls are not followed: the callee goes into `calls_to` and the walk
    /// resumes at the return address. Reaching a register-indirect branch
    /// or call is fatal.
    pub fn analyze(store: &mut InstructionStore<'_>, entry: Address) -> Result<Self, TranslateError> {
        let mut stack: Vec<(Option<Address>, Address)> = vec![(None, entry)];
        let mut visited: BTreeMap<u32, Step> = BTreeMap::new();
        let mut labels = BTreeSet::from([entry.linear()]);
        let mut calls_to = BTreeSet::new();

        while let Some((referent, addr)) = stack.pop() {
            if visited.contains_key(&addr.linear()) {
                continue;
            }
            let insn = store.fetch(addr)?.clone();
            if insn.dynamic {
                return Err(TranslateError::DynamicBranch {
                    address: insn.address,
                    line: insn.text,
                });
            }

            if insn.opcode.is_call() {
                calls_to.extend(insn.labels.iter().copied());
                stack.push((Some(insn.address), insn.fall_through()));
            } else {
                labels.extend(insn.labels.iter().map(Address::linear));
                for next in insn.next.iter().rev() {
                    stack.push((Some(insn.address), *next));
                }
            }
            visited.insert(addr.linear(), Step { insn, referent });
        }

        let steps: Vec<Step> = visited.into_values().collect();

        // Overlapping decodes can put another instruction between one
        // instruction and its fall-through; those need a jump and a label.
        for (i, step) in steps.iter().enumerate() {
            if !step.insn.falls_through() {
                continue;
            }
            let next = step.insn.fall_through();
            if steps.get(i + 1).map(|s| s.insn.address) != Some(next) {
                labels.insert(next.linear());
            }
        }

        log::debug!(
            "subroutine {}: {} instructions, {} labels, {} callees",
            entry,
            steps.len(),
            labels.len(),
            calls_to.len()
        );
        Ok(Subroutine {
            entry,
            steps,
            labels,
            calls_to,
        })
    }

    /// C function name, `sub_` plus the linear entry.
    pub fn name(&self) -> String {
        self.entry.function_name()
    }

    /// Whether `addr` needs a `loc_` label.
    pub fn is_label(&self, addr: Address) -> bool {
        self.labels.contains(&addr.linear())
    }

    /// Lowest linear address of any instruction in the body.
    pub fn lowest(&self) -> Option<u32> {
        self.steps.first().map(|s| s.insn.address.linear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslatorOptions;
    use crate::store::scripted::{image, Scripted};

    const SEG: u16 = 0x1000;

    fn analyze(listing: &[(u16, usize, &str)], entry: u16) -> Result<Subroutine, TranslateError> {
        let image = image();
        let mut store = InstructionStore::new(
            &image,
            Box::new(Scripted::new(listing)),
            &TranslatorOptions::default(),
        );
        Subroutine::analyze(&mut store, Address::new(SEG, entry))
    }

    fn offsets(sub: &Subroutine) -> Vec<u16> {
        sub.steps.iter().map(|s| s.insn.address.offset()).collect()
    }

    #[test]
    fn test_loop_visits_each_instruction_once() {
        let sub = analyze(
            &[
                (0, 1, "dec cx"),
                (1, 3, "cmp cx, 0"),
                (4, 2, "jz 0x0"),
                (6, 1, "ret"),
            ],
            0,
        )
        .unwrap();
        assert_eq!(offsets(&sub), vec![0, 1, 4, 6]);
        assert_eq!(sub.labels, BTreeSet::from([0x10000]));
        assert!(sub.calls_to.is_empty());
    }

    #[test]
    fn test_subroutine_without_return_is_legal() {
        let sub = analyze(&[(0, 1, "nop"), (1, 2, "jmp 0x0")], 0).unwrap();
        assert_eq!(offsets(&sub), vec![0, 1]);
    }

    #[test]
    fn test_calls_are_recorded_not_followed() {
        let sub = analyze(
            &[(0, 3, "call 0x10"), (3, 1, "ret"), (0x10, 1, "nop"), (0x11, 1, "ret")],
            0,
        )
        .unwrap();
        assert_eq!(offsets(&sub), vec![0, 3]);
        assert_eq!(sub.calls_to, BTreeSet::from([Address::new(SEG, 0x10)]));
        assert!(!sub.is_label(Address::new(SEG, 0x10)));
        assert_eq!(sub.steps[1].referent, Some(Address::new(SEG, 0)));
        assert_eq!(sub.steps[0].referent, None);
    }

    #[test]
    fn test_branch_targets_become_labels() {
        let sub = analyze(
            &[(0, 2, "je 0x10"), (2, 2, "jmp 0x20"), (0x10, 1, "ret"), (0x20, 1, "ret")],
            0,
        )
        .unwrap();
        assert_eq!(offsets(&sub), vec![0, 2, 0x10, 0x20]);
        assert_eq!(sub.labels, BTreeSet::from([0x10000, 0x10010, 0x10020]));
    }

    #[test]
    fn test_overlapping_fall_through_gets_label() {
        let sub = analyze(
            &[
                (0, 3, "mov ax, 0x1234"),
                (1, 2, "xor al, 0x12"),
                (3, 1, "nop"),
                (4, 2, "jmp 0x1"),
            ],
            0,
        )
        .unwrap();
        assert_eq!(offsets(&sub), vec![0, 1, 3, 4]);
        assert!(sub.is_label(Address::new(SEG, 3)));
        assert!(sub.is_label(Address::new(SEG, 1)));
    }

    #[test]
    fn test_dynamic_branch_is_fatal() {
        let err = analyze(&[(0, 1, "nop"), (1, 2, "jmp bx")], 0).unwrap_err();
        match err {
            TranslateError::DynamicBranch { address, line } => {
                assert_eq!(address, Address::new(SEG, 1));
                assert_eq!(line, "jmp bx");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unreached_garbage_is_ignored() {
        let sub = analyze(&[(0, 1, "ret"), (1, 1, "mov eax, 1")], 0).unwrap();
        assert_eq!(offsets(&sub), vec![0]);
    }
}
