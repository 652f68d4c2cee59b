//! Operand model: literals, registers, memory references and far addresses.
//!
//! Operands are decoded from the text a disassembly backend prints. Both the
//! capstone dialect (`word ptr es:[bx + 4]`) and the ndisasm dialect
//! (`word [es:bx+0x4]`) are accepted. Widths are in bytes.

use std::collections::BTreeSet;
use std::fmt;

use crate::{Address, TranslateError};

/// Where an operand came from, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct Site<'a> {
    pub address: Address,
    pub line: &'a str,
}

impl<'a> Site<'a> {
    pub fn new(address: Address, line: &'a str) -> Self {
        Self { address, line }
    }

    /// An `UnsupportedOperand` error at this site.
    pub fn unsupported(&self, text: &str) -> TranslateError {
        TranslateError::UnsupportedOperand {
            address: self.address,
            text: text.to_string(),
            line: self.line.to_string(),
        }
    }

    /// A `Codegen` error at this site.
    pub fn codegen(&self, reason: impl Into<String>) -> TranslateError {
        TranslateError::Codegen {
            address: self.address,
            reason: reason.into(),
            line: self.line.to_string(),
        }
    }
}

/// 8086 register names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Ax, Bx, Cx, Dx, Si, Di, Bp, Sp,
    Al, Ah, Bl, Bh, Cl, Ch, Dl, Dh,
    Cs, Ds, Es, Ss,
}

impl Reg {
    /// Register from its lower-case name.
    pub fn parse(name: &str) -> Option<Self> {
        let reg = match name {
            "ax" => Reg::Ax,
            "bx" => Reg::Bx,
            "cx" => Reg::Cx,
            "dx" => Reg::Dx,
            "si" => Reg::Si,
            "di" => Reg::Di,
            "bp" => Reg::Bp,
            "sp" => Reg::Sp,
            "al" => Reg::Al,
            "ah" => Reg::Ah,
            "bl" => Reg::Bl,
            "bh" => Reg::Bh,
            "cl" => Reg::Cl,
            "ch" => Reg::Ch,
            "dl" => Reg::Dl,
            "dh" => Reg::Dh,
            "cs" => Reg::Cs,
            "ds" => Reg::Ds,
            "es" => Reg::Es,
            "ss" => Reg::Ss,
            _ => return None,
        };
        Some(reg)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Reg::Ax => "ax",
            Reg::Bx => "bx",
            Reg::Cx => "cx",
            Reg::Dx => "dx",
            Reg::Si => "si",
            Reg::Di => "di",
            Reg::Bp => "bp",
            Reg::Sp => "sp",
            Reg::Al => "al",
            Reg::Ah => "ah",
            Reg::Bl => "bl",
            Reg::Bh => "bh",
            Reg::Cl => "cl",
            Reg::Ch => "ch",
            Reg::Dl => "dl",
            Reg::Dh => "dh",
            Reg::Cs => "cs",
            Reg::Ds => "ds",
            Reg::Es => "es",
            Reg::Ss => "ss",
        }
    }

    /// Width in bytes, 1 or 2.
    pub fn width(&self) -> u8 {
        match self {
            Reg::Al | Reg::Ah | Reg::Bl | Reg::Bh | Reg::Cl | Reg::Ch | Reg::Dl | Reg::Dh => 1,
            _ => 2,
        }
    }

    /// One of `cs`, `ds`, `es` or `ss`.
    pub fn is_segment(&self) -> bool {
        matches!(self, Reg::Cs | Reg::Ds | Reg::Es | Reg::Ss)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A memory reference: segment register plus a sum of offset terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indirect {
    pub segment: Reg,
    /// Registers and literals summed (mod 0x10000) to form the offset
    pub offsets: Vec<Operand>,
    pub width: Option<u8>,
}

/// One decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal { value: u16, width: Option<u8> },
    Register(Reg),
    Indirect(Indirect),
    /// `SSSS:OOOO` far pointer, as used by far jumps and calls
    Far(Address),
}

impl Operand {
    /// Immediate with its width still open.
    pub fn literal(value: u16) -> Self {
        Operand::Literal { value, width: None }
    }

    /// Width in bytes, if known.
    pub fn width(&self) -> Option<u8> {
        match self {
            Operand::Literal { width, .. } => *width,
            Operand::Register(reg) => Some(reg.width()),
            Operand::Indirect(ind) => ind.width,
            Operand::Far(_) => Some(4),
        }
    }

    fn set_width(&mut self, w: u8) {
        match self {
            Operand::Literal { value, width } => {
                if w == 1 {
                    *value &= 0xff;
                }
                *width = Some(w);
            }
            Operand::Indirect(ind) => ind.width = Some(w),
            Operand::Register(_) | Operand::Far(_) => {}
        }
    }

    pub fn as_literal(&self) -> Option<u16> {
        match self {
            Operand::Literal { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Value expression: literal, register field, or memory dereference.
    pub fn render(&self, site: &Site<'_>) -> Result<String, TranslateError> {
        match self {
            Operand::Literal { value, width } => Ok(render_literal(*value, width.unwrap_or(2))),
            Operand::Register(reg) => Ok(format!("r.{}", reg.name())),
            Operand::Indirect(ind) => match ind.width {
                Some(1) => Ok(format!("m[{}]", ind.address_expr(0, site)?)),
                Some(2) => Ok(format!("*(uint16_t *)&m[{}]", ind.address_expr(0, site)?)),
                other => Err(site.codegen(format!(
                    "memory operand width {:?} is neither 1 nor 2",
                    other
                ))),
            },
            Operand::Far(addr) => Err(site.codegen(format!("far pointer {} used as a value", addr))),
        }
    }

    /// The value cast to a signed integer of the operand's width.
    pub fn render_signed(&self, site: &Site<'_>) -> Result<String, TranslateError> {
        self.render_signed_as(self.value_width(site)?, site)
    }

    /// The value cast to a signed integer of `width` bytes.
    pub fn render_signed_as(&self, width: u8, site: &Site<'_>) -> Result<String, TranslateError> {
        let ty = match width {
            1 => "int8_t",
            _ => "int16_t",
        };
        Ok(format!("({}){}", ty, self.render(site)?))
    }

    /// The value widened to 32-bit unsigned.
    pub fn render_wide(&self, site: &Site<'_>) -> Result<String, TranslateError> {
        Ok(format!("(uint32_t){}", self.render(site)?))
    }

    /// Width of a value operand, 1 or 2.
    pub fn value_width(&self, site: &Site<'_>) -> Result<u8, TranslateError> {
        match self {
            Operand::Literal { width, .. } => Ok(width.unwrap_or(2)),
            Operand::Far(addr) => Err(site.codegen(format!("far pointer {} used as a value", addr))),
            other => match other.width() {
                Some(w @ (1 | 2)) => Ok(w),
                w => Err(site.codegen(format!("operand width {:?} is neither 1 nor 2", w))),
            },
        }
    }
}

impl Indirect {
    /// Sum of the offset terms, plus `extra`, truncated to 16 bits.
    pub fn offset_expr(&self, extra: u16, site: &Site<'_>) -> Result<String, TranslateError> {
        let mut terms = Vec::with_capacity(self.offsets.len() + 1);
        for term in &self.offsets {
            match term {
                Operand::Register(reg) => terms.push(format!("r.{}", reg.name())),
                Operand::Literal { value, .. } => terms.push(render_literal(*value, 2)),
                other => return Err(site.codegen(format!("bad offset term {:?}", other))),
            }
        }
        if extra != 0 {
            terms.push(render_literal(extra, 2));
        }
        if terms.is_empty() {
            return Ok("0".to_string());
        }
        Ok(format!("(uint16_t)({})", terms.join(" + ")))
    }

    /// Linear address: segment shifted left four bits plus the offset.
    pub fn address_expr(&self, extra: u16, site: &Site<'_>) -> Result<String, TranslateError> {
        Ok(format!(
            "(((uint32_t)r.{} << 4) + {})",
            self.segment.name(),
            self.offset_expr(extra, site)?
        ))
    }
}

/// Bare decimal below 16, otherwise hex zero-padded to the width.
pub fn render_literal(value: u16, width: u8) -> String {
    let value = if width == 1 { value & 0xff } else { value };
    if value < 16 {
        value.to_string()
    } else if width == 1 {
        format!("0x{:02X}", value)
    } else {
        format!("0x{:04X}", value)
    }
}

/// Parse a numeric literal: `0x1f`, `1fh`, decimal, optional leading `-`.
/// Negative values wrap into unsigned 16-bit form.
pub fn parse_number(text: &str) -> Option<u16> {
    let text = text.trim();
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, text.strip_prefix('+').unwrap_or(text).trim_start()),
    };
    if !body.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let value = if let Some(hex) = body.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = body.strip_suffix('h') {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        body.parse::<u32>().ok()?
    };
    if value > 0xffff {
        return None;
    }
    let value = value as u16;
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Remove a leading size keyword. Returns the declared width, if any.
fn take_width(text: &str) -> (Option<u8>, &str) {
    for (keyword, width) in [("byte", 1u8), ("word", 2), ("dword", 4)] {
        if let Some(rest) = text.strip_prefix(keyword) {
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('[') {
                let rest = rest.trim_start();
                let rest = rest.strip_prefix("ptr").map(str::trim_start).unwrap_or(rest);
                return (Some(width), rest);
            }
        }
    }
    (None, text)
}

/// Remove jump-distance keywords the translation does not need.
fn strip_distance(text: &str) -> &str {
    let mut text = text;
    loop {
        let before = text;
        for keyword in ["short ", "near ", "far "] {
            if let Some(rest) = text.strip_prefix(keyword) {
                text = rest.trim_start();
            }
        }
        if before == text {
            return text;
        }
    }
}

/// Decode one operand. The flag is true when the width came from an
/// explicit size keyword.
pub fn parse_operand(raw: &str, site: &Site<'_>) -> Result<(Operand, bool), TranslateError> {
    let lowered = raw.trim().to_lowercase();
    let text = strip_distance(&lowered);
    let (width, text) = take_width(text);
    let text = strip_distance(text);
    let declared = width.is_some();

    if let Some(value) = parse_number(text) {
        let mut op = Operand::literal(value);
        if let Some(w) = width {
            op.set_width(w);
        }
        return Ok((op, declared));
    }

    if text.len() == 2 {
        if let Some(reg) = Reg::parse(text) {
            return Ok((Operand::Register(reg), declared));
        }
    }

    if text.ends_with(']') && text.contains('[') {
        let mut ind = parse_indirect(text, raw, site)?;
        ind.width = width;
        return Ok((Operand::Indirect(ind), declared));
    }

    if let Ok(target) = text.parse::<Address>() {
        return Ok((Operand::Far(target), declared));
    }

    Err(site.unsupported(raw.trim()))
}

fn parse_segment(text: &str, raw: &str, site: &Site<'_>) -> Result<Reg, TranslateError> {
    match parse_operand(text, site)? {
        (Operand::Register(reg), _) if reg.is_segment() => Ok(reg),
        _ => Err(site.unsupported(raw.trim())),
    }
}

fn parse_indirect(text: &str, raw: &str, site: &Site<'_>) -> Result<Indirect, TranslateError> {
    let open = text.find('[').ok_or_else(|| site.unsupported(raw.trim()))?;
    let prefix = text[..open].trim().trim_end_matches(':').trim();
    let mut inner = text[open + 1..text.len() - 1].trim();

    let mut segment = None;
    if !prefix.is_empty() {
        segment = Some(parse_segment(prefix, raw, site)?);
    }
    if let Some((seg, rest)) = inner.split_once(':') {
        segment = Some(parse_segment(seg, raw, site)?);
        inner = rest.trim();
    }

    let compact: String = inner.chars().filter(|c| !c.is_whitespace()).collect();
    let mut offsets = Vec::new();
    let mut term = String::new();
    let mut negative = false;
    let mut flush = |term: &mut String, negative: bool| -> Result<(), TranslateError> {
        if term.is_empty() {
            return Err(site.unsupported(raw.trim()));
        }
        let op = match parse_operand(term, site)?.0 {
            Operand::Literal { value, .. } if negative => Operand::literal(value.wrapping_neg()),
            Operand::Literal { value, .. } => Operand::literal(value),
            Operand::Register(reg @ (Reg::Bx | Reg::Si | Reg::Di | Reg::Bp)) if !negative => {
                Operand::Register(reg)
            }
            _ => return Err(site.unsupported(raw.trim())),
        };
        offsets.push(op);
        term.clear();
        Ok(())
    };
    for (i, c) in compact.chars().enumerate() {
        match c {
            '+' | '-' => {
                if !term.is_empty() {
                    flush(&mut term, negative)?;
                } else if i != 0 {
                    return Err(site.unsupported(raw.trim()));
                }
                negative = c == '-';
            }
            _ => term.push(c),
        }
    }
    flush(&mut term, negative)?;

    let segment = segment.unwrap_or_else(|| {
        if offsets.contains(&Operand::Register(Reg::Bp)) {
            Reg::Ss
        } else {
            Reg::Ds
        }
    });
    Ok(Indirect {
        segment,
        offsets,
        width: None,
    })
}

/// Split operand text on top-level commas.
pub fn split_operands(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts
}

/// Decode a whole operand list and back-propagate widths.
pub fn parse_operands(text: &str, site: &Site<'_>) -> Result<Vec<Operand>, TranslateError> {
    let mut ops = Vec::new();
    let mut declared = Vec::new();
    for part in split_operands(text) {
        let (op, explicit) = parse_operand(part, site)?;
        ops.push(op);
        declared.push(explicit);
    }
    infer_widths(&mut ops, &declared, site)?;
    Ok(ops)
}

/// Give every operand of unknown width the unique width of its sized
/// siblings. Two explicit size keywords that disagree, or an unknown
/// operand whose siblings disagree, is a contradiction. Literals nobody
/// sizes default to a word.
pub fn infer_widths(
    ops: &mut [Operand],
    declared: &[bool],
    site: &Site<'_>,
) -> Result<(), TranslateError> {
    let contradiction = |first: u8, second: u8| TranslateError::ContradictoryWidth {
        address: site.address,
        first,
        second,
        line: site.line.to_string(),
    };

    let mut explicit: Option<u8> = None;
    for (op, is_declared) in ops.iter().zip(declared) {
        if !is_declared {
            continue;
        }
        if let Some(w) = op.width() {
            match explicit {
                Some(seen) if seen != w => return Err(contradiction(seen, w)),
                _ => explicit = Some(w),
            }
        }
    }

    for i in 0..ops.len() {
        if ops[i].width().is_some() {
            continue;
        }
        let siblings: BTreeSet<u8> = ops
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .filter_map(|(_, op)| op.width())
            .filter(|w| *w != 4)
            .collect();
        let mut iter = siblings.iter();
        match (iter.next(), iter.next()) {
            (Some(&w), None) => ops[i].set_width(w),
            (Some(&a), Some(&b)) => return Err(contradiction(a, b)),
            _ => {}
        }
    }

    // `add ax, byte -0x1`: a sign-extended imm8 takes the register's width.
    let wide = ops
        .iter()
        .any(|op| !matches!(op, Operand::Literal { .. }) && op.width() == Some(2));
    for op in ops.iter_mut() {
        match op {
            Operand::Literal { width: width @ None, .. } => *width = Some(2),
            Operand::Literal { value, width: width @ Some(1) } if wide => {
                *value = *value as u8 as i8 as i16 as u16;
                *width = Some(2);
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn site() -> Site<'static> {
        Site::new(Address::new(0x1000, 0x0010), "test")
    }

    fn parse(text: &str) -> Operand {
        parse_operand(text, &site()).unwrap().0
    }

    #[rstest]
    #[case("0x1234", 0x1234)]
    #[case("12", 12)]
    #[case("0ah", 0x0a)]
    #[case("-2", 0xfffe)]
    #[case("-0x10", 0xfff0)]
    fn test_literals(#[case] text: &str, #[case] value: u16) {
        assert_eq!(parse(text), Operand::Literal { value, width: None });
    }

    #[test]
    fn test_register_not_mistaken_for_hex() {
        assert_eq!(parse("ah"), Operand::Register(Reg::Ah));
        assert_eq!(parse("bh"), Operand::Register(Reg::Bh));
        assert_eq!(parse("ch").width(), Some(1));
        assert_eq!(parse("cx").width(), Some(2));
    }

    #[rstest]
    #[case("word ptr [bx + si + 4]")]
    #[case("word [bx+si+0x4]")]
    fn test_indirect_dialects(#[case] text: &str) {
        let (op, declared) = parse_operand(text, &site()).unwrap();
        assert!(declared);
        assert_eq!(
            op,
            Operand::Indirect(Indirect {
                segment: Reg::Ds,
                offsets: vec![
                    Operand::Register(Reg::Bx),
                    Operand::Register(Reg::Si),
                    Operand::literal(4),
                ],
                width: Some(2),
            })
        );
    }

    #[rstest]
    #[case("byte ptr es:[di]")]
    #[case("byte [es:di]")]
    fn test_segment_override(#[case] text: &str) {
        match parse(text) {
            Operand::Indirect(ind) => {
                assert_eq!(ind.segment, Reg::Es);
                assert_eq!(ind.offsets, vec![Operand::Register(Reg::Di)]);
                assert_eq!(ind.width, Some(1));
            }
            other => panic!("expected indirect, got {:?}", other),
        }
    }

    #[rstest]
    #[case("[bp - 2]")]
    #[case("[bp-0x2]")]
    fn test_negative_displacement_and_stack_segment(#[case] text: &str) {
        match parse(text) {
            Operand::Indirect(ind) => {
                assert_eq!(ind.segment, Reg::Ss);
                assert_eq!(ind.offsets[1], Operand::literal(0xfffe));
            }
            other => panic!("expected indirect, got {:?}", other),
        }
    }

    #[test]
    fn test_far_and_distance_keywords() {
        assert_eq!(parse("0x1000:0x0200"), Operand::Far(Address::new(0x1000, 0x200)));
        assert_eq!(parse("short 0x12"), Operand::literal(0x12));
        assert_eq!(parse("near 0x1234"), Operand::literal(0x1234));
    }

    #[rstest]
    #[case("eax")]
    #[case("[bx-si]")]
    #[case("st(0)")]
    #[case("[ax]")]
    fn test_unsupported(#[case] text: &str) {
        let err = parse_operand(text, &site()).unwrap_err();
        assert!(matches!(err, TranslateError::UnsupportedOperand { .. }));
        assert!(err.to_string().contains("1000:0010"));
    }

    #[test]
    fn test_width_inferred_from_register_sibling() {
        let ops = parse_operands("byte [bx], al", &site()).unwrap();
        assert_eq!(ops[0].width(), Some(1));
        assert_eq!(ops[1].width(), Some(1));

        let ops = parse_operands("[bx], al", &site()).unwrap();
        assert_eq!(ops[0].width(), Some(1));

        let ops = parse_operands("al, 0x1ff", &site()).unwrap();
        assert_eq!(ops[1], Operand::Literal { value: 0xff, width: Some(1) });
    }

    #[test]
    fn test_mixed_register_widths_are_not_inferred() {
        let ops = parse_operands("ax, cl", &site()).unwrap();
        assert_eq!(ops[0].width(), Some(2));
        assert_eq!(ops[1].width(), Some(1));
    }

    #[rstest]
    #[case("ax, byte -0x1", 0xffff)]
    #[case("ax, byte +0x7f", 0x7f)]
    #[case("bx, byte 0x80", 0xff80)]
    fn test_sign_extended_immediate_widens(#[case] text: &str, #[case] value: u16) {
        let ops = parse_operands(text, &site()).unwrap();
        assert_eq!(ops[1].as_literal(), Some(value));
        assert_eq!(ops[1].width(), Some(2));
    }

    #[test]
    fn test_byte_immediate_stays_byte_next_to_byte_register() {
        let ops = parse_operands("al, byte -0x1", &site()).unwrap();
        assert_eq!(ops[1].as_literal(), Some(0xff));
        assert_eq!(ops[1].width(), Some(1));
        assert_eq!(ops[1].render(&site()).unwrap(), "0xFF");
    }

    #[test]
    fn test_contradictory_declared_widths() {
        let err = parse_operands("byte [bx], word [si]", &site()).unwrap_err();
        match err {
            TranslateError::ContradictoryWidth { first, second, .. } => {
                assert_eq!((first, second), (1, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_contradictory_inference() {
        let err = parse_operands("[bx], ax, cl", &site()).unwrap_err();
        assert!(matches!(err, TranslateError::ContradictoryWidth { .. }));
    }

    #[test]
    fn test_split_operands() {
        assert_eq!(split_operands("ax, word ptr [bx + si]"), vec!["ax", "word ptr [bx + si]"]);
        assert!(split_operands("").is_empty());
    }

    #[rstest]
    #[case(5, 2, "5")]
    #[case(15, 1, "15")]
    #[case(16, 1, "0x10")]
    #[case(0x21, 2, "0x0021")]
    #[case(0xfffe, 1, "0xFE")]
    fn test_render_literal(#[case] value: u16, #[case] width: u8, #[case] text: &str) {
        assert_eq!(render_literal(value, width), text);
    }

    #[test]
    fn test_render_memory() {
        let ops = parse_operands("word ptr [bx + 4], ax", &site()).unwrap();
        assert_eq!(
            ops[0].render(&site()).unwrap(),
            "*(uint16_t *)&m[(((uint32_t)r.ds << 4) + (uint16_t)(r.bx + 4))]"
        );
        assert_eq!(ops[1].render_signed(&site()).unwrap(), "(int16_t)r.ax");
        assert_eq!(ops[1].render_wide(&site()).unwrap(), "(uint32_t)r.ax");

        let ops = parse_operands("byte [0x1234], 1", &site()).unwrap();
        assert_eq!(
            ops[0].render(&site()).unwrap(),
            "m[(((uint32_t)r.ds << 4) + (uint16_t)(0x1234))]"
        );
    }

    #[test]
    fn test_render_unsized_memory_fails() {
        let (op, _) = parse_operand("[bx]", &site()).unwrap();
        let err = op.render(&site()).unwrap_err();
        assert!(matches!(err, TranslateError::Codegen { .. }));
    }
}
