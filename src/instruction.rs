//! Decoded instructions, the opcode set, and record-level decoding.

use std::collections::BTreeSet;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::operand::{parse_operands, split_operands, Operand, Reg, Site};
use crate::{Address, RawRecord, TranslateError};

/// How a disassembler's near branch literal maps to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchBase {
    /// The literal is an offset from the start of the enclosing segment
    #[default]
    Segment,
    /// The literal is a signed displacement from the next instruction
    NextInstruction,
}

impl fmt::Display for BranchBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchBase::Segment => write!(f, "segment"),
            BranchBase::NextInstruction => write!(f, "next-instruction"),
        }
    }
}

/// Branch conditions of the 8086 conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Overflow,
    NoOverflow,
    Below,
    AboveOrEqual,
    Equal,
    NotEqual,
    BelowOrEqual,
    Above,
    Sign,
    NoSign,
    Parity,
    NoParity,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
}

impl Condition {
    fn from_mnemonic(m: &str) -> Option<Self> {
        let cond = match m {
            "jo" => Condition::Overflow,
            "jno" => Condition::NoOverflow,
            "jb" | "jc" | "jnae" => Condition::Below,
            "jae" | "jnb" | "jnc" => Condition::AboveOrEqual,
            "je" | "jz" => Condition::Equal,
            "jne" | "jnz" => Condition::NotEqual,
            "jbe" | "jna" => Condition::BelowOrEqual,
            "ja" | "jnbe" => Condition::Above,
            "js" => Condition::Sign,
            "jns" => Condition::NoSign,
            "jp" | "jpe" => Condition::Parity,
            "jnp" | "jpo" => Condition::NoParity,
            "jl" | "jnge" => Condition::Less,
            "jge" | "jnl" => Condition::GreaterOrEqual,
            "jle" | "jng" => Condition::LessOrEqual,
            "jg" | "jnle" => Condition::Greater,
            _ => return None,
        };
        Some(cond)
    }

    /// The `j` mnemonic testing this condition.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Condition::Overflow => "jo",
            Condition::NoOverflow => "jno",
            Condition::Below => "jb",
            Condition::AboveOrEqual => "jae",
            Condition::Equal => "je",
            Condition::NotEqual => "jne",
            Condition::BelowOrEqual => "jbe",
            Condition::Above => "ja",
            Condition::Sign => "js",
            Condition::NoSign => "jns",
            Condition::Parity => "jp",
            Condition::NoParity => "jnp",
            Condition::Less => "jl",
            Condition::GreaterOrEqual => "jge",
            Condition::LessOrEqual => "jle",
            Condition::Greater => "jg",
        }
    }
}

/// String instruction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOp {
    Movs,
    Lods,
    Stos,
    Cmps,
    Scas,
}

/// Repeat prefixes, folded into the string instruction that follows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repeat {
    Rep,
    Repe,
    Repne,
}

impl Repeat {
    fn parse(m: &str) -> Option<Self> {
        match m {
            "rep" => Some(Repeat::Rep),
            "repe" | "repz" => Some(Repeat::Repe),
            "repne" | "repnz" => Some(Repeat::Repne),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Repeat::Rep => "rep",
            Repeat::Repe => "repe",
            Repeat::Repne => "repne",
        }
    }
}

/// The closed set of opcodes the translator knows. Anything else decodes
/// as `Unsupported` and fails at generation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov, Xchg, Lea, Les, Lds, Push, Pop, Pushf, Popf,
    Add, Adc, Sub, Sbb, Cmp, And, Or, Xor, Test,
    Inc, Dec, Neg, Not, Mul, Imul, Div, Idiv,
    Shl, Shr, Sar, Rol, Ror, Rcl, Rcr,
    Cbw, Cwd, Lahf, Sahf, Xlat,
    Clc, Stc, Cmc, Cld, Std, Cli, Sti,
    Nop, Hlt, Int, In, Out,
    Call { far: bool },
    Jmp { far: bool },
    Ret, Retf, Iret,
    Jcc(Condition),
    Loop, Loope, Loopne, Jcxz,
    Str { op: StringOp, width: u8, repeat: Option<Repeat> },
    Unsupported(String),
}

impl Opcode {
    /// Map a (prefix-folded) mnemonic such as `mov` or `rep_movsw`.
    pub fn from_mnemonic(mnemonic: &str) -> Self {
        use Opcode::*;
        match mnemonic {
            "mov" => Mov,
            "xchg" => Xchg,
            "lea" => Lea,
            "les" => Les,
            "lds" => Lds,
            "push" => Push,
            "pop" => Pop,
            "pushf" | "pushfw" => Pushf,
            "popf" | "popfw" => Popf,
            "add" => Add,
            "adc" => Adc,
            "sub" => Sub,
            "sbb" => Sbb,
            "cmp" => Cmp,
            "and" => And,
            "or" => Or,
            "xor" => Xor,
            "test" => Test,
            "inc" => Inc,
            "dec" => Dec,
            "neg" => Neg,
            "not" => Not,
            "mul" => Mul,
            "imul" => Imul,
            "div" => Div,
            "idiv" => Idiv,
            "shl" | "sal" => Shl,
            "shr" => Shr,
            "sar" => Sar,
            "rol" => Rol,
            "ror" => Ror,
            "rcl" => Rcl,
            "rcr" => Rcr,
            "cbw" => Cbw,
            "cwd" => Cwd,
            "lahf" => Lahf,
            "sahf" => Sahf,
            "xlat" | "xlatb" => Xlat,
            "clc" => Clc,
            "stc" => Stc,
            "cmc" => Cmc,
            "cld" => Cld,
            "std" => Std,
            "cli" => Cli,
            "sti" => Sti,
            "nop" => Nop,
            "hlt" => Hlt,
            "int" | "int3" => Int,
            "in" => In,
            "out" => Out,
            "call" => Call { far: false },
            "lcall" => Call { far: true },
            "jmp" => Jmp { far: false },
            "ljmp" => Jmp { far: true },
            "ret" | "retn" => Ret,
            "retf" | "lret" => Retf,
            "iret" | "iretw" => Iret,
            "loop" => Loop,
            "loope" | "loopz" => Loope,
            "loopne" | "loopnz" => Loopne,
            "jcxz" => Jcxz,
            other => {
                if let Some(cond) = Condition::from_mnemonic(other) {
                    Jcc(cond)
                } else if let Some(op) = Self::string_op(other) {
                    op
                } else {
                    Unsupported(other.to_string())
                }
            }
        }
    }

    fn string_op(mnemonic: &str) -> Option<Self> {
        let (repeat, base) = match mnemonic.split_once('_') {
            Some((prefix, base)) => (Some(Repeat::parse(prefix)?), base),
            None => (None, mnemonic),
        };
        let (stem, width) = if let Some(stem) = base.strip_suffix('b') {
            (stem, 1)
        } else {
            (base.strip_suffix('w')?, 2)
        };
        let op = match stem {
            "movs" => StringOp::Movs,
            "lods" => StringOp::Lods,
            "stos" => StringOp::Stos,
            "cmps" => StringOp::Cmps,
            "scas" => StringOp::Scas,
            _ => return None,
        };
        // A bare `rep` on a comparing string op repeats while equal.
        let repeat = match (repeat, op) {
            (Some(Repeat::Rep), StringOp::Cmps | StringOp::Scas) => Some(Repeat::Repe),
            (other, _) => other,
        };
        Some(Opcode::Str { op, width, repeat })
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Opcode::Ret | Opcode::Retf | Opcode::Iret)
    }

    /// Near or far call, direct or not.
    pub fn is_call(&self) -> bool {
        matches!(self, Opcode::Call { .. })
    }

    /// Instructions whose first operand is a control-flow target.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::Call { .. }
                | Opcode::Jmp { .. }
                | Opcode::Jcc(_)
                | Opcode::Loop
                | Opcode::Loope
                | Opcode::Loopne
                | Opcode::Jcxz
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Opcode::*;
        let tag = match self {
            Mov => "mov",
            Xchg => "xchg",
            Lea => "lea",
            Les => "les",
            Lds => "lds",
            Push => "push",
            Pop => "pop",
            Pushf => "pushf",
            Popf => "popf",
            Add => "add",
            Adc => "adc",
            Sub => "sub",
            Sbb => "sbb",
            Cmp => "cmp",
            And => "and",
            Or => "or",
            Xor => "xor",
            Test => "test",
            Inc => "inc",
            Dec => "dec",
            Neg => "neg",
            Not => "not",
            Mul => "mul",
            Imul => "imul",
            Div => "div",
            Idiv => "idiv",
            Shl => "shl",
            Shr => "shr",
            Sar => "sar",
            Rol => "rol",
            Ror => "ror",
            Rcl => "rcl",
            Rcr => "rcr",
            Cbw => "cbw",
            Cwd => "cwd",
            Lahf => "lahf",
            Sahf => "sahf",
            Xlat => "xlat",
            Clc => "clc",
            Stc => "stc",
            Cmc => "cmc",
            Cld => "cld",
            Std => "std",
            Cli => "cli",
            Sti => "sti",
            Nop => "nop",
            Hlt => "hlt",
            Int => "int",
            In => "in",
            Out => "out",
            Call { far: false } => "call",
            Call { far: true } => "lcall",
            Jmp { far: false } => "jmp",
            Jmp { far: true } => "ljmp",
            Ret => "ret",
            Retf => "retf",
            Iret => "iret",
            Jcc(cond) => cond.mnemonic(),
            Loop => "loop",
            Loope => "loope",
            Loopne => "loopne",
            Jcxz => "jcxz",
            Str { op, width, repeat } => {
                if let Some(rep) = repeat {
                    write!(f, "{}_", rep.name())?;
                }
                let stem = match op {
                    StringOp::Movs => "movs",
                    StringOp::Lods => "lods",
                    StringOp::Stos => "stos",
                    StringOp::Cmps => "cmps",
                    StringOp::Scas => "scas",
                };
                return write!(f, "{}{}", stem, if *width == 1 { "b" } else { "w" });
            }
            Unsupported(m) => m.as_str(),
        };
        f.write_str(tag)
    }
}

/// One decoded instruction. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: Address,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    /// Raw encoding, prefixes included
    pub bytes: Vec<u8>,
    /// Disassembly text, kept for diagnostics and output comments
    pub text: String,
    /// Where control may go next
    pub next: BTreeSet<Address>,
    /// The subset of `next` that are jump or call targets
    pub labels: BTreeSet<Address>,
    /// Branch or call whose target is not known statically
    pub dynamic: bool,
}

impl Instruction {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the instruction that follows in memory.
    pub fn fall_through(&self) -> Address {
        self.address.add(self.bytes.len() as u32)
    }

    /// True when execution can continue at `fall_through()`, directly or
    /// after a call returns.
    pub fn falls_through(&self) -> bool {
        !matches!(self.opcode, Opcode::Jmp { .. }) && !self.opcode.is_return()
    }

    /// Statically known jump or call target.
    pub fn target(&self) -> Option<Address> {
        self.labels.iter().next().copied()
    }

    /// Error context for this instruction.
    pub fn site(&self) -> Site<'_> {
        Site::new(self.address, &self.text)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.address, self.text)
    }
}

/// A prefix-only record waiting for the instruction it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prefix {
    Repeat(Repeat),
    Segment(Reg),
    Lock,
}

fn classify(record: &RawRecord) -> Option<Prefix> {
    if !record.operands.is_empty() {
        return None;
    }
    if record.mnemonic == "lock" {
        return Some(Prefix::Lock);
    }
    if let Some(rep) = Repeat::parse(&record.mnemonic) {
        return Some(Prefix::Repeat(rep));
    }
    match Reg::parse(&record.mnemonic) {
        Some(reg) if reg.is_segment() => Some(Prefix::Segment(reg)),
        _ => None,
    }
}

/// Rename `rep movsw` style mnemonics to `rep_movsw` and drop `lock`.
fn normalize_mnemonic(mnemonic: &str) -> String {
    let mut words: Vec<&str> = mnemonic.split_whitespace().collect();
    words.retain(|w| *w != "lock");
    match words.as_slice() {
        [prefix, rest @ ..] if !rest.is_empty() && Repeat::parse(prefix).is_some() => {
            let rep = Repeat::parse(prefix).map(|r| r.name()).unwrap_or(prefix);
            format!("{}_{}", rep, rest.join("_"))
        }
        _ => words.join(" "),
    }
}

/// Move a segment override into the first memory operand that lacks one.
fn apply_segment(operands: &str, seg: Reg) -> String {
    let mut parts: Vec<String> = split_operands(operands).into_iter().map(str::to_string).collect();
    if let Some(part) = parts.iter_mut().find(|p| p.contains('[') && !p.contains(':')) {
        *part = part.replacen('[', &format!("[{}:", seg.name()), 1);
    }
    parts.join(", ")
}

fn merge(prefix: RawRecord, kind: Prefix, mut next: RawRecord) -> RawRecord {
    let mut bytes = prefix.bytes;
    bytes.extend_from_slice(&next.bytes);
    next.bytes = bytes;
    next.offset = prefix.offset;
    match kind {
        Prefix::Repeat(rep) => next.mnemonic = format!("{}_{}", rep.name(), next.mnemonic),
        Prefix::Segment(seg) => next.operands = apply_segment(&next.operands, seg),
        Prefix::Lock => {}
    }
    next
}

/// Fold prefix-only records into the instruction that follows them, so a
/// prefix never survives as an instruction of its own. The merged record
/// keeps the prefix's offset and spans both encodings. A prefix left
/// dangling at the end of the batch is dropped.
pub fn fold_prefixes(records: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut out = Vec::with_capacity(records.len());
    let mut pending: Vec<(RawRecord, Prefix)> = Vec::new();
    for mut record in records {
        if let Some(kind) = classify(&record) {
            pending.push((record, kind));
            continue;
        }
        record.mnemonic = normalize_mnemonic(&record.mnemonic);
        // Innermost prefix first so the outermost ends up owning the offset.
        while let Some((prefix, kind)) = pending.pop() {
            record = merge(prefix, kind, record);
        }
        out.push(record);
    }
    if let Some((dangling, _)) = pending.first() {
        log::warn!(
            "dropping dangling prefix `{}` at offset 0x{:04x}",
            dangling.mnemonic,
            dangling.offset
        );
    }
    out
}

/// True when the encoding is a far jump or call (EA, 9A, FF /3, FF /5).
fn encoding_is_far(bytes: &[u8]) -> bool {
    let body = bytes
        .iter()
        .skip_while(|b| matches!(b, 0x26 | 0x2e | 0x36 | 0x3e | 0xf0 | 0xf2 | 0xf3));
    let mut body = body.copied();
    match (body.next(), body.next()) {
        (Some(0xea), _) | (Some(0x9a), _) => true,
        (Some(0xff), Some(modrm)) => matches!((modrm >> 3) & 7, 3 | 5),
        _ => false,
    }
}

/// Decode one folded record into an instruction at `address`.
///
/// `base` says how near branch literals map to addresses; `None` means the
/// record has no base context (a patch), so branch targets must be written
/// as absolute `SSSS:OOOO` addresses.
pub fn decode(
    record: &RawRecord,
    address: Address,
    base: Option<BranchBase>,
) -> Result<Instruction, TranslateError> {
    let text = record.to_string();
    let site = Site::new(address, &text);

    let mnemonic = normalize_mnemonic(&record.mnemonic);
    let mut opcode = Opcode::from_mnemonic(&mnemonic);
    let mut operands = parse_operands(&record.operands, &site)?;

    if mnemonic == "int3" && operands.is_empty() {
        operands.push(Operand::Literal { value: 3, width: Some(1) });
    }
    let far = record.operands.to_lowercase().contains("far") || encoding_is_far(&record.bytes);
    match &mut opcode {
        Opcode::Call { far: f } | Opcode::Jmp { far: f } => *f = *f || far,
        _ => {}
    }

    let instruction_end = address.add(record.len() as u32);
    let mut next = BTreeSet::new();
    let mut labels = BTreeSet::new();
    let mut dynamic = false;

    if opcode.is_branch() {
        let target = match operands.first() {
            Some(Operand::Literal { value, .. }) => match base {
                Some(BranchBase::Segment) => Some(Address::new(address.segment(), *value)),
                Some(BranchBase::NextInstruction) => {
                    Some(instruction_end.add_signed(*value as i16))
                }
                None => {
                    return Err(TranslateError::Config(format!(
                        "patch at {}: branch target in `{}` must be written as SSSS:OOOO",
                        address, text
                    )))
                }
            },
            Some(Operand::Far(target)) => Some(*target),
            _ => None,
        };
        match target {
            Some(target) => {
                next.insert(target);
                labels.insert(target);
            }
            None => dynamic = true,
        }
        if !matches!(opcode, Opcode::Jmp { .. }) {
            next.insert(instruction_end);
        }
    } else if !opcode.is_return() {
        next.insert(instruction_end);
    }

    Ok(Instruction {
        address,
        opcode,
        operands,
        bytes: record.bytes.clone(),
        text,
        next,
        labels,
        dynamic,
    })
}
