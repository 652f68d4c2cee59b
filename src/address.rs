//! Real-mode segment:offset addresses.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::TranslateError;

/// A real-mode address. Compared, ordered and hashed by its linear value,
/// so `1000:0010` and `1001:0000` are the same address.
#[derive(Clone, Copy)]
pub struct Address {
    segment: u16,
    offset: u16,
    linear: u32,
}

impl Address {
    /// `segment:offset`, kept as written.
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self {
            segment,
            offset,
            linear: ((segment as u32) << 4) + offset as u32,
        }
    }

    /// Build from a segment and an offset that may exceed 16 bits; every
    /// 0x10000 of offset is folded into the segment as 0x1000 paragraphs.
    pub const fn normalized(segment: u16, offset: u32) -> Self {
        let carry = (offset >> 16) as u16;
        Self::new(
            segment.wrapping_add(carry.wrapping_mul(0x1000)),
            (offset & 0xffff) as u16,
        )
    }

    /// Address of `linear` expressed against `segment`.
    pub const fn from_linear(segment: u16, linear: u32) -> Self {
        Self::normalized(segment, linear.wrapping_sub((segment as u32) << 4))
    }

    /// Segment part, as written.
    pub const fn segment(&self) -> u16 {
        self.segment
    }

    /// Offset within the segment.
    pub const fn offset(&self) -> u16 {
        self.offset
    }

    /// Physical address, `segment * 16 + offset`.
    pub const fn linear(&self) -> u32 {
        self.linear
    }

    /// Advance the offset by `delta`, carrying into the segment on overflow.
    pub const fn add(&self, delta: u32) -> Self {
        Self::normalized(self.segment, self.offset as u32 + delta)
    }

    /// Apply a signed near displacement; wraps within the segment.
    pub const fn add_signed(&self, delta: i16) -> Self {
        Self::new(self.segment, self.offset.wrapping_add(delta as u16))
    }

    /// Jump-target name, unique per linear address.
    pub fn label(&self) -> String {
        format!("loc_{:05X}", self.linear)
    }

    /// Function name of a subroutine entered at this address.
    pub fn function_name(&self) -> String {
        format!("sub_{:05X}", self.linear)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.linear == other.linear
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.linear.hash(state)
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.linear.cmp(&other.linear)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

/// Parse a hex number with an optional `0x` prefix or `h` suffix.
pub(crate) fn parse_hex(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .or_else(|| {
            text.strip_suffix(|c: char| c == 'h' || c == 'H')
                .filter(|d| d.starts_with(|c: char| c.is_ascii_digit()))
        })
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

impl FromStr for Address {
    type Err = TranslateError;

    /// Parses `SSSS:OOOO` (hex, optional `0x` on either half).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TranslateError::InvalidAddress(s.to_string());
        let (seg, off) = s.split_once(':').ok_or_else(invalid)?;
        let segment = parse_hex(seg).filter(|v| *v <= 0xffff).ok_or_else(invalid)?;
        let offset = parse_hex(off).filter(|v| *v <= 0xffff).ok_or_else(invalid)?;
        Ok(Address::new(segment as u16, offset as u16))
    }
}
