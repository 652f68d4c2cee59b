//! C code generation: program layout, subroutine bodies and instruction
//! statements.
//!
//! The output is one C file meant to be compiled against `runtime.h`,
//! which provides `struct cpu`, the memory array `m` and the interrupt and
//! port callbacks. Each subroutine becomes a function that takes a copy of
//! the caller's register state and writes it back on return.

mod emit;
pub mod flags;

use std::collections::{BTreeSet, HashMap};

use crate::analysis::{Program, Subroutine};
use crate::operand::render_literal;
use crate::TranslateError;

pub use self::emit::instruction;

const STACK_HELPERS: &str = r#"static inline void push16(struct cpu *c, uint16_t v)
{
    c->sp -= 2;
    *(uint16_t *)&m[((uint32_t)c->ss << 4) + c->sp] = v;
}

static inline uint16_t pop16(struct cpu *c)
{
    uint16_t v = *(uint16_t *)&m[((uint32_t)c->ss << 4) + c->sp];
    c->sp += 2;
    return v;
}
"#;

const INDENT: &str = "    ";

/// Generates C from analyzed subroutines.
pub struct CodeGen<'h> {
    /// Hook statements keyed by linear address
    hooks: &'h HashMap<u32, Vec<String>>,
}

impl<'h> CodeGen<'h> {
    /// Generator placing `hooks` before the instructions they key.
    pub fn new(hooks: &'h HashMap<u32, Vec<String>>) -> Self {
        Self { hooks }
    }

    /// Render the whole program: preamble, data image, forward
    /// declarations, subroutine bodies and the entry trampoline.
    pub fn program(&self, program: &Program) -> Result<String, TranslateError> {
        let entry = program.entry_subroutine().ok_or_else(|| TranslateError::Codegen {
            address: program.entry,
            reason: "entry point was never analyzed".to_string(),
            line: String::new(),
        })?;

        let mut output = String::new();
        output.push_str(&format!(
            "/* Generated by mz2c from an MZ executable. Entry point {}. */\n\n",
            program.entry
        ));
        output.push_str("#include <stdint.h>\n#include <string.h>\n#include \"runtime.h\"\n\n");
        output.push_str("#pragma GCC diagnostic ignored \"-Wunused-label\"\n\n");
        output.push_str(flags::PRELUDE);
        output.push('\n');
        output.push_str(STACK_HELPERS);
        output.push('\n');
        output.push_str(&data_section(program));
        output.push('\n');

        for sub in program.subroutines.values() {
            output.push_str(&format!("static void {}(struct cpu *caller);\n", sub.name()));
        }
        output.push('\n');

        for sub in program.subroutines.values() {
            output.push_str(&self.subroutine(sub)?);
            output.push('\n');
        }

        output.push_str(&trampoline(program, entry));
        self.warn_unplaced_hooks(program);
        log::info!(
            "generated {} functions, {} bytes of C",
            program.subroutines.len(),
            output.len()
        );
        Ok(output)
    }

    /// Render one subroutine as a C function.
    pub fn subroutine(&self, sub: &Subroutine) -> Result<String, TranslateError> {
        let mut output = String::new();
        output.push_str(&format!("static void {}(struct cpu *caller)\n{{\n", sub.name()));
        output.push_str(&format!("{}struct cpu r = *caller;\n", INDENT));

        for (i, step) in sub.steps.iter().enumerate() {
            let insn = &step.insn;
            if sub.is_label(insn.address) {
                output.push_str(&format!("{}:;\n", insn.address.label()));
            }
            if let Some(hooks) = self.hooks.get(&insn.address.linear()) {
                for hook in hooks {
                    for line in hook.lines() {
                        output.push_str(&format!("{}{}\n", INDENT, line));
                    }
                }
            }

            let statement = instruction(insn)?;
            let referent = match step.referent {
                Some(from) => format!(" from {}", from),
                None => String::new(),
            };
            output.push_str(&format!(
                "{}{} /* {} {}{} */\n",
                INDENT,
                statement,
                insn.address,
                comment_safe(&insn.text),
                referent
            ));

            // Instructions are emitted in address order; when the next one
            // emitted is not the fall-through, jump there explicitly.
            if insn.falls_through() {
                let next = insn.fall_through();
                if sub.steps.get(i + 1).map(|s| s.insn.address) != Some(next) {
                    output.push_str(&format!("{}goto {};\n", INDENT, next.label()));
                }
            }
        }

        output.push_str("}\n");
        Ok(output)
    }

    fn warn_unplaced_hooks(&self, program: &Program) {
        let placed: BTreeSet<u32> = program
            .subroutines
            .values()
            .flat_map(|s| s.steps.iter().map(|step| step.insn.address.linear()))
            .collect();
        let mut unplaced: Vec<u32> = self
            .hooks
            .keys()
            .filter(|linear| !placed.contains(linear))
            .copied()
            .collect();
        unplaced.sort_unstable();
        for linear in unplaced {
            log::warn!(
                "hook at linear address {:05X} matches no translated instruction",
                linear
            );
        }
    }
}

fn comment_safe(text: &str) -> String {
    text.replace("*/", "* /")
}

fn data_section(program: &Program) -> String {
    let mut output = String::new();
    output.push_str(&format!("#define DATA_BASE 0x{:05X}u\n", program.data_base));
    output.push_str(&format!("#define DATA_SIZE {}u\n", program.data_image.len()));
    output.push_str(&format!("#define MEMORY_SIZE 0x{:05X}u\n\n", program.memory_size));

    if program.data_image.is_empty() {
        output.push_str("static const uint8_t data_image[1] = { 0 };\n");
        return output;
    }
    output.push_str(&format!(
        "static const uint8_t data_image[{}] = {{\n",
        program.data_image.len()
    ));
    for chunk in program.data_image.chunks(16) {
        let row: Vec<String> = chunk.iter().map(|b| format!("0x{:02X}", b)).collect();
        output.push_str(&format!("{}{},\n", INDENT, row.join(", ")));
    }
    output.push_str("};\n");
    output
}

fn trampoline(program: &Program, entry: &Subroutine) -> String {
    let word = |v: u16| render_literal(v, 2);
    let mut output = String::new();
    output.push_str("void run_program(struct cpu *cpu)\n{\n");
    output.push_str(&format!("{}memcpy(&m[DATA_BASE], data_image, DATA_SIZE);\n", INDENT));
    output.push_str(&format!("{}cpu->cs = {};\n", INDENT, word(entry.entry.segment())));
    output.push_str(&format!("{}cpu->ip = {};\n", INDENT, word(entry.entry.offset())));
    output.push_str(&format!("{}cpu->ss = {};\n", INDENT, word(program.stack.segment())));
    output.push_str(&format!("{}cpu->sp = {};\n", INDENT, word(program.stack.offset())));
    output.push_str(&format!("{}cpu->ds = {};\n", INDENT, word(program.psp_segment)));
    output.push_str(&format!("{}cpu->es = {};\n", INDENT, word(program.psp_segment)));
    output.push_str(&format!("{}cpu->df = 0;\n", INDENT));
    output.push_str(&format!("{}cpu->ifl = 1;\n", INDENT));
    output.push_str(&format!("{}cpu->sres = 0;\n", INDENT));
    output.push_str(&format!("{}cpu->ures = 1;\n", INDENT));
    output.push_str(&format!("{}{}(cpu);\n", INDENT, entry.name()));
    output.push_str("}\n");
    output
}
